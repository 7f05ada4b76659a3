//! Error types for Dotlink
//!
//! Every failure a handler can hit is classified by an [`ErrorKind`]. The
//! kind travels with the error event so an application can react to the
//! category without parsing the message.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// Closed set of error categories reported by the handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Address text could not be parsed as an IP address
    BadAddress,
    /// Port outside `0..=65535`
    BadPort,
    /// Receive buffer size was zero or negative
    BadBufferSize,
    /// Binding the local socket failed (usually the port is taken)
    BindFailed,
    /// Outbound connection attempt failed
    ConnectingFailed,
    /// Operation needs a socket that was never created
    SocketNotCreated,
    /// Closing the connection failed
    DisconnectingFailed,
    /// Writing a message failed
    SendingMessageFailed,
    /// Entering the listening state failed
    ListeningFailed,
    /// Peer could not be reached or removed
    KickFailed,
    /// A datagram receive failed
    ReceivingFailed,
    /// Caller passed an argument that makes no sense for the operation
    BadParameter,
    Undefined,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BadAddress => "bad address",
            ErrorKind::BadPort => "bad port",
            ErrorKind::BadBufferSize => "bad buffer size",
            ErrorKind::BindFailed => "bind failed",
            ErrorKind::ConnectingFailed => "connecting failed",
            ErrorKind::SocketNotCreated => "socket not created",
            ErrorKind::DisconnectingFailed => "disconnecting failed",
            ErrorKind::SendingMessageFailed => "sending message failed",
            ErrorKind::ListeningFailed => "listening failed",
            ErrorKind::KickFailed => "kick failed",
            ErrorKind::ReceivingFailed => "receiving failed",
            ErrorKind::BadParameter => "bad parameter",
            ErrorKind::Undefined => "undefined error",
        };
        f.write_str(name)
    }
}

/// Dotlink result type
pub type Result<T> = std::result::Result<T, Error>;

/// An error with its category, a readable message and the I/O cause if any
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Build an error caused by an I/O failure
    pub fn io(kind: ErrorKind, message: impl Into<String>, source: io::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Message including the I/O cause, as shown in error events
    pub fn detail(&self) -> String {
        match &self.source {
            Some(e) => format!("{}: {}", self.message, e),
            None => self.message.clone(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::io(ErrorKind::Undefined, "I/O error", e)
    }
}
