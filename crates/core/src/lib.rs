//! Dotlink Core Library
//!
//! Pieces shared by every Dotlink handler: the error taxonomy, socket
//! configuration with validation, and the event channel handlers use to talk
//! to the owning application.

pub mod config;
pub mod error;
pub mod event;

pub use config::{
    parse_endpoint, parse_ip, validate_port, SocketOptions, ValidatedOptions, DEFAULT_BACKLOG,
    DEFAULT_BUFFER_SIZE, DEFAULT_DATAGRAM_PORT, DEFAULT_STREAM_PORT,
};
pub use error::{Error, ErrorKind, Result};
pub use event::{EventChannel, Subscription, SubscriptionId, DEFAULT_EVENT_CAPACITY};
