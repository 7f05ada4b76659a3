//! Dotlink Network Library
//!
//! Socket handlers that run their I/O on background tasks and report
//! everything that happens as [`NetEvent`]s.
//!
//! # Architecture
//!
//! - **TcpServer**: accepts connections, keeps a registry of peers, one
//!   receive task per peer
//! - **TcpClient**: one outbound connection with one receive task
//! - **UdpHandler**: one datagram socket with one receive task, unicast and
//!   fan-out sends
//!
//! Payloads are raw bytes. Framing is up to the application.
//!
//! # Usage
//!
//! ```ignore
//! let events = NetEvents::new();
//! let mut sub = events.subscribe();
//! let server = TcpServer::configure(&SocketOptions::server(7000), events);
//! server.start_listening()?;
//!
//! while let Some(event) = sub.recv().await {
//!     match event {
//!         NetEvent::MessageReceived(msg) => { server.send(&msg.peer, &msg.data).await?; }
//!         NetEvent::Error { kind, message } => { /* handle */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod error;
pub mod event;
pub mod peer;
mod session;
pub mod server;
pub mod udp;

pub use client::{ConnectionState, TcpClient};
pub use dotlink_core::{EventChannel, SocketOptions, Subscription};
pub use error::{Error, ErrorKind, Result};
pub use event::{NetEvent, NetEvents};
pub use peer::{InboundMessage, PeerHandle, PeerId};
pub use server::TcpServer;
pub use udp::UdpHandler;
