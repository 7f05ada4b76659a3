//! Network error reporting
//!
//! Handlers never let a failure escape as a panic. Each failure becomes an
//! [`Error`], is logged, and is emitted as [`NetEvent::Error`] before being
//! handed back to the caller.

use tracing::warn;

pub use dotlink_core::{Error, ErrorKind, Result};

use crate::event::{NetEvent, NetEvents};

/// Log an error, emit it on the channel and give it back
///
/// Does not wait for subscribers, so it is usable from synchronous calls.
pub(crate) fn report(events: &NetEvents, err: Error) -> Error {
    warn!(kind = %err.kind(), error = %err.detail(), "Handler error");
    events.try_emit(NetEvent::Error {
        kind: err.kind(),
        message: err.detail(),
    });
    err
}

/// Shorthand for reporting a freshly built error as `Err`
pub(crate) fn fail<T>(events: &NetEvents, kind: ErrorKind, message: impl Into<String>) -> Result<T> {
    Err(report(events, Error::new(kind, message)))
}
