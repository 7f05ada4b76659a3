//! Events emitted by the handlers

use std::net::SocketAddr;

use dotlink_core::{ErrorKind, EventChannel};

use crate::peer::{InboundMessage, PeerHandle};

/// Event channel carrying [`NetEvent`]s
pub type NetEvents = EventChannel<NetEvent>;

/// Notification from a handler to its application
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// Server accept loop or datagram receive loop is running
    ListeningStarted { local_addr: SocketAddr },
    /// Client connection established
    Connected { peer: PeerHandle },
    /// Server accepted and registered a peer
    ClientConnected { peer: PeerHandle },
    /// Server peer went away; fires before the peer leaves the registry
    ClientDisconnected { peer: PeerHandle },
    /// Client connection ended
    Disconnected { peer: PeerHandle },
    /// One successful read
    MessageReceived(InboundMessage),
    /// Something failed; the kind tells what
    Error { kind: ErrorKind, message: String },
}

impl NetEvent {
    /// Error kind, if this is an error event
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            NetEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Peer the event is about, if any
    pub fn peer(&self) -> Option<&PeerHandle> {
        match self {
            NetEvent::Connected { peer }
            | NetEvent::ClientConnected { peer }
            | NetEvent::ClientDisconnected { peer }
            | NetEvent::Disconnected { peer } => Some(peer),
            NetEvent::MessageReceived(msg) => Some(&msg.peer),
            NetEvent::ListeningStarted { .. } | NetEvent::Error { .. } => None,
        }
    }
}
