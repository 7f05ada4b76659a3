//! Peer handles and inbound messages
//!
//! A [`PeerHandle`] stands for one remote endpoint. Stream peers own their
//! write half and a close signal observed by their receive loop. Datagram
//! peers are synthesized per packet and only refer weakly to the handler's
//! socket, so a kept message does not keep the port bound.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Identity of a peer, unique per connection or packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(Uuid);

impl PeerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

enum Transport {
    Stream {
        writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
        closed: watch::Sender<bool>,
    },
    Datagram(Weak<UdpSocket>),
}

struct PeerInner {
    id: PeerId,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    transport: Transport,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Set once the connect event is out
    ready: watch::Sender<bool>,
    disconnect_notified: AtomicBool,
}

/// Handle to one remote endpoint
///
/// Cheap to clone; all clones refer to the same connection. Two handles are
/// equal when they refer to the same peer, even if the remote address is
/// shared with another peer.
#[derive(Clone)]
pub struct PeerHandle {
    inner: Arc<PeerInner>,
}

impl PeerHandle {
    /// Wrap an established stream connection
    ///
    /// Returns the handle and the close signal its receive loop should watch.
    pub(crate) fn stream(remote_addr: SocketAddr, writer: OwnedWriteHalf) -> (Self, watch::Receiver<bool>) {
        let (closed, closed_rx) = watch::channel(false);
        let handle = Self::with_transport(
            remote_addr,
            Transport::Stream {
                writer: tokio::sync::Mutex::new(Some(writer)),
                closed,
            },
            false,
        );
        (handle, closed_rx)
    }

    /// Ephemeral handle for the sender of one datagram
    pub(crate) fn datagram(remote_addr: SocketAddr, socket: &Arc<UdpSocket>) -> Self {
        Self::with_transport(remote_addr, Transport::Datagram(Arc::downgrade(socket)), true)
    }

    fn with_transport(remote_addr: SocketAddr, transport: Transport, ready: bool) -> Self {
        let (ready, _) = watch::channel(ready);
        Self {
            inner: Arc::new(PeerInner {
                id: PeerId::new(),
                remote_addr,
                connected_at: Utc::now(),
                transport,
                worker: Mutex::new(None),
                ready,
                disconnect_notified: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// When the connection was accepted, or the datagram received
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self.inner.transport, Transport::Datagram(_))
    }

    /// Whether the transport is still open
    ///
    /// A datagram peer stays reachable while its handler's socket is open.
    pub fn is_connected(&self) -> bool {
        match &self.inner.transport {
            Transport::Stream { closed, .. } => !*closed.borrow(),
            Transport::Datagram(socket) => socket.strong_count() > 0,
        }
    }

    /// Write the whole buffer to the peer
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        match &self.inner.transport {
            Transport::Stream { writer, .. } => {
                let mut writer = writer.lock().await;
                match writer.as_mut() {
                    Some(w) => {
                        w.write_all(data).await?;
                        w.flush().await
                    }
                    None => Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "connection closed",
                    )),
                }
            }
            Transport::Datagram(socket) => match socket.upgrade() {
                Some(socket) => socket.send_to(data, self.inner.remote_addr).await.map(|_| ()),
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
            },
        }
    }

    /// Close the transport
    ///
    /// Wakes the receive loop and shuts the write side down. Only the first
    /// call does anything; it returns `true`. Datagram peers share the
    /// handler's socket and are never closed through a handle.
    pub(crate) async fn close(&self) -> bool {
        let Transport::Stream { writer, closed } = &self.inner.transport else {
            return false;
        };

        let first = closed.send_if_modified(|c| !std::mem::replace(c, true));
        if !first {
            return false;
        }

        if let Some(mut w) = writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        true
    }

    /// Mark the connect event as delivered
    pub(crate) fn mark_ready(&self) {
        self.inner.ready.send_replace(true);
    }

    pub(crate) fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Wait until the connect event is delivered
    ///
    /// Receive loops and disconnect paths wait here so no disconnect or
    /// message event can overtake the connect event.
    pub(crate) async fn ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        let _ = ready.wait_for(|r| *r).await;
    }

    /// Claim the right to emit this peer's disconnect event
    ///
    /// Returns `true` exactly once per peer.
    pub(crate) fn claim_disconnect(&self) -> bool {
        !self.inner.disconnect_notified.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_worker(&self, handle: JoinHandle<()>) {
        *self.inner.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub(crate) fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Wait for the receive loop to finish, if it has not been joined yet
    pub(crate) async fn join_worker(&self) {
        if let Some(handle) = self.take_worker() {
            let _ = handle.await;
        }
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for PeerHandle {}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("datagram", &self.is_datagram())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.inner.remote_addr, self.inner.id)
    }
}

/// One successful read from a peer
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub peer: PeerHandle,
    /// Exactly the bytes that were read
    pub data: Arc<[u8]>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub(crate) fn new(peer: PeerHandle, data: &[u8]) -> Self {
        Self {
            peer,
            data: Arc::from(data),
            received_at: Utc::now(),
        }
    }

    /// Number of valid bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
