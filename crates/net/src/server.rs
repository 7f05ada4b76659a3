//! TCP server handler
//!
//! Accepts connections, keeps the registry of connected peers and runs one
//! receive task per peer. The registry lock is held for every mutation and
//! every whole-registry read. Events are emitted outside of it, since
//! emitting waits for slow subscribers. Subscribers observe:
//!
//! - `ClientConnected` only after the peer is in [`TcpServer::peers`]
//! - nothing else for a peer before its `ClientConnected`
//! - `ClientDisconnected` exactly once, before the transport is closed and
//!   the peer leaves the registry
//!
//! Dropping the server stops the accept task and closes every peer.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use dotlink_core::{SocketOptions, Subscription, ValidatedOptions};

use crate::error::{fail, report, Error, ErrorKind, Result};
use crate::event::{NetEvent, NetEvents};
use crate::peer::PeerHandle;
use crate::session::{join_task, receive_loop, runtime};

/// Insertion-ordered list of connected peers
type Registry = Arc<AsyncMutex<Vec<PeerHandle>>>;

/// Shortest pause after a failed accept
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
/// Longest pause after repeated failed accepts
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// State shared between the server handle and its tasks
#[derive(Clone)]
struct Shared {
    peers: Registry,
    events: NetEvents,
    buffer_size: usize,
    /// Turns true when the server is dropped
    teardown: watch::Receiver<bool>,
}

/// Running accept loop
struct ListenTask {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// TCP server handle
pub struct TcpServer {
    options: Option<ValidatedOptions>,
    local_addr: Option<SocketAddr>,
    /// Bound socket waiting for `start_listening`
    socket: Mutex<Option<TcpSocket>>,
    listen_task: Mutex<Option<ListenTask>>,
    teardown: watch::Sender<bool>,
    shared: Shared,
}

impl TcpServer {
    /// Validate the options and bind the listening socket
    ///
    /// Never fails outright. Bad options are reported on `events` as
    /// `BadAddress`, `BadPort` or `BadBufferSize`, a taken port as
    /// `BindFailed`; the server is then left unusable and every later
    /// operation reports `SocketNotCreated`.
    pub fn configure(options: &SocketOptions, events: NetEvents) -> Self {
        let (teardown, teardown_rx) = watch::channel(false);
        let mut server = TcpServer {
            options: None,
            local_addr: None,
            socket: Mutex::new(None),
            listen_task: Mutex::new(None),
            teardown,
            shared: Shared {
                peers: Arc::new(AsyncMutex::new(Vec::new())),
                buffer_size: 0,
                events,
                teardown: teardown_rx,
            },
        };

        let validated = match options.validate() {
            Ok(v) => v,
            Err(e) => {
                report(&server.shared.events, e);
                return server;
            }
        };

        let socket = match bind_socket(&validated) {
            Ok(s) => s,
            Err(e) => {
                report(
                    &server.shared.events,
                    Error::io(
                        ErrorKind::BindFailed,
                        format!("cannot bind {}, probably another application uses this port", validated.addr),
                        e,
                    ),
                );
                return server;
            }
        };

        server.local_addr = socket.local_addr().ok();
        info!(addr = ?server.local_addr, backlog = validated.backlog, "Server bound");

        server.options = Some(validated);
        server.shared.buffer_size = validated.buffer_size;
        *server.socket.get_mut().unwrap_or_else(|e| e.into_inner()) = Some(socket);
        server
    }

    /// Whether configuration succeeded
    pub fn is_configured(&self) -> bool {
        self.options.is_some()
    }

    /// The bound address, useful when binding to port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn events(&self) -> &NetEvents {
        &self.shared.events
    }

    pub fn subscribe(&self) -> Subscription<NetEvent> {
        self.shared.events.subscribe()
    }

    /// Start accepting connections in the background
    ///
    /// The socket is listening when this returns; a failure is reported as
    /// `ListeningFailed`. `ListeningStarted` is emitted once the accept task
    /// is waiting for connections.
    pub fn start_listening(&self) -> Result<()> {
        let Some(options) = self.options else {
            return fail(&self.shared.events, ErrorKind::SocketNotCreated, "server is not configured");
        };

        let mut task = lock(&self.listen_task);
        if task.is_some() {
            return fail(&self.shared.events, ErrorKind::BadParameter, "server is already listening");
        }

        let rt = runtime(&self.shared.events, ErrorKind::ListeningFailed)?;

        let Some(socket) = lock(&self.socket).take() else {
            return fail(
                &self.shared.events,
                ErrorKind::SocketNotCreated,
                "listening socket was closed, configure a new server",
            );
        };

        let listener = socket.listen(options.backlog).map_err(|e| {
            report(
                &self.shared.events,
                Error::io(
                    ErrorKind::ListeningFailed,
                    "cannot listen, probably another application uses this port",
                    e,
                ),
            )
        })?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = rt.spawn(accept_loop(listener, self.shared.clone(), shutdown_rx));
        *task = Some(ListenTask { shutdown_tx, handle });
        Ok(())
    }

    /// Stop accepting connections and close the listening socket
    ///
    /// Connected peers stay connected. Waits for the accept task to exit;
    /// with a timeout, a task that does not exit in time is aborted.
    pub async fn stop_listening(&self, timeout: Option<Duration>) -> Result<()> {
        if self.options.is_none() {
            return fail(&self.shared.events, ErrorKind::SocketNotCreated, "server is not configured");
        }

        // Never started: just close the bound socket
        drop(lock(&self.socket).take());

        let task = lock(&self.listen_task).take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(());
            join_task(task.handle, timeout).await;
            info!(addr = ?self.local_addr, "Server stopped listening");
        }
        Ok(())
    }

    /// Whether the accept loop is running
    pub fn is_listening(&self) -> bool {
        lock(&self.listen_task)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Send data to one peer
    ///
    /// A failure is reported as `KickFailed` and leaves the peer registered;
    /// only its own receive loop or [`kick`](Self::kick) removes it.
    pub async fn send(&self, peer: &PeerHandle, data: &[u8]) -> Result<()> {
        if self.options.is_none() {
            return fail(&self.shared.events, ErrorKind::SocketNotCreated, "server is not configured");
        }

        peer.send(data).await.map_err(|e| {
            report(
                &self.shared.events,
                Error::io(
                    ErrorKind::KickFailed,
                    format!("peer {} is not connected to the server", peer),
                    e,
                ),
            )
        })
    }

    /// Send data to every registered peer
    ///
    /// Best effort: a failing peer is skipped silently. Returns how many
    /// peers the data was written to.
    pub async fn send_to_all(&self, data: &[u8]) -> usize {
        let peers = self.shared.peers.lock().await;
        let mut delivered = 0;
        for peer in peers.iter() {
            match peer.send(data).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = %peer.id(), error = %e, "Broadcast to peer failed"),
            }
        }
        delivered
    }

    /// Disconnect one peer and remove it from the registry
    ///
    /// Reports `KickFailed` if the peer is not registered. Returns once the
    /// peer's receive task has ended.
    pub async fn kick(&self, peer: &PeerHandle) -> Result<()> {
        if !self.shared.peers.lock().await.contains(peer) {
            return fail(
                &self.shared.events,
                ErrorKind::KickFailed,
                format!("peer {} is not connected to the server", peer),
            );
        }

        announce_disconnect(peer, &self.shared.events).await;
        peer.close().await;
        self.shared.peers.lock().await.retain(|p| p != peer);

        peer.join_worker().await;
        info!(peer = %peer.id(), addr = %peer.remote_addr(), "Peer kicked");
        Ok(())
    }

    /// Disconnect every peer
    ///
    /// Best effort; failures for individual peers are ignored.
    pub async fn kick_all(&self) {
        let kicked = self.peers().await;

        for peer in &kicked {
            announce_disconnect(peer, &self.shared.events).await;
            peer.close().await;
        }
        self.shared.peers.lock().await.retain(|p| !kicked.contains(p));

        for peer in &kicked {
            peer.join_worker().await;
        }
        if !kicked.is_empty() {
            info!(count = kicked.len(), "Kicked all peers");
        }
    }

    /// Stop listening, then disconnect every peer
    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        self.stop_listening(timeout).await?;
        self.kick_all().await;
        Ok(())
    }

    /// Snapshot of the registered peers
    pub async fn peers(&self) -> Vec<PeerHandle> {
        self.shared.peers.lock().await.clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.lock().await.len()
    }

    /// Remote addresses of the registered peers
    pub async fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.shared
            .peers
            .lock()
            .await
            .iter()
            .map(|p| p.remote_addr())
            .collect()
    }

    /// Remote IPs of the registered peers, without ports
    pub async fn peer_ips(&self) -> Vec<IpAddr> {
        self.peer_addrs().await.into_iter().map(|a| a.ip()).collect()
    }

    /// Remote IPs of the registered peers as text
    pub async fn peer_ip_strings(&self) -> Vec<String> {
        self.peer_ips()
            .await
            .into_iter()
            .map(|ip| ip.to_string())
            .collect()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // May be stuck announcing a peer to a subscriber that stopped reading
        if let Some(task) = lock(&self.listen_task).take() {
            task.handle.abort();
        }
        // Peer tasks close their connections and exit
        self.teardown.send_replace(true);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Create and bind the listening socket without listening yet
fn bind_socket(options: &ValidatedOptions) -> std::io::Result<TcpSocket> {
    let socket = if options.addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    // Accepted sockets inherit the receive buffer size
    let size = u32::try_from(options.buffer_size).unwrap_or(u32::MAX);
    if let Err(e) = socket.set_recv_buffer_size(size) {
        debug!(error = %e, "Could not set receive buffer size");
    }

    socket.bind(options.addr)?;
    Ok(socket)
}

/// Accept incoming connections until shutdown
async fn accept_loop(
    listener: TcpListener,
    shared: Shared,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    match listener.local_addr() {
        Ok(local_addr) => {
            info!(addr = %local_addr, "Server listening");
            shared.events.emit(NetEvent::ListeningStarted { local_addr }).await;
        }
        Err(e) => {
            report(
                &shared.events,
                Error::io(ErrorKind::ListeningFailed, "listening socket has no address", e),
            );
            return;
        }
    }

    let mut failures = 0u32;
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        failures = 0;
                        debug!(addr = %addr, "New connection");
                        register_peer(stream, addr, &shared).await;
                    }
                    Err(e) => {
                        // Out of descriptors fails every accept until one frees up
                        failures = failures.saturating_add(1);
                        let pause = accept_backoff(failures);
                        error!(error = %e, failures, retry_in_ms = pause.as_millis() as u64, "Accept failed");
                        tokio::select! {
                            _ = tokio::time::sleep(pause) => {}
                            _ = shutdown_rx.recv() => {
                                info!("Accept loop shutting down");
                                break;
                            }
                        }
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Pause before the next accept after `failures` failures in a row
fn accept_backoff(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    ACCEPT_BACKOFF_MIN.saturating_mul(factor).min(ACCEPT_BACKOFF_MAX)
}

/// Marks the peer ready on drop, also when the accept task is aborted
/// while announcing it
struct MarkReady(PeerHandle);

impl Drop for MarkReady {
    fn drop(&mut self) {
        self.0.mark_ready();
    }
}

/// Spawn the peer's receive task, register it and announce it
async fn register_peer(stream: TcpStream, addr: SocketAddr, shared: &Shared) {
    let (reader, writer) = stream.into_split();
    let (peer, closed) = PeerHandle::stream(addr, writer);

    let task_peer = peer.clone();
    let task_shared = shared.clone();
    let handle = tokio::spawn(async move {
        let mut teardown = task_shared.teardown.clone();
        let read = async {
            // Nothing is read before ClientConnected is out
            task_peer.ready().await;
            receive_loop(
                reader,
                &task_peer,
                closed,
                task_shared.buffer_size,
                &task_shared.events,
            )
            .await
        };
        tokio::select! {
            exit = read => {
                debug!(peer = %task_peer.id(), exit = ?exit, "Receive loop ended");
                disconnect_peer(&task_peer, &task_shared).await;
            }
            _ = async { let _ = teardown.wait_for(|t| *t).await; } => {
                debug!(peer = %task_peer.id(), "Server dropped, closing peer");
                teardown_peer(&task_peer, &task_shared).await;
            }
        }
    });
    peer.set_worker(handle);

    let ready = MarkReady(peer.clone());
    shared.peers.lock().await.push(peer.clone());
    info!(peer = %peer.id(), addr = %addr, "Peer connected");
    shared.events.emit(NetEvent::ClientConnected { peer }).await;
    drop(ready);
}

/// Emit the peer's disconnect event unless someone already did
async fn announce_disconnect(peer: &PeerHandle, events: &NetEvents) -> bool {
    peer.ready().await;
    if !peer.claim_disconnect() {
        return false;
    }
    events
        .emit(NetEvent::ClientDisconnected { peer: peer.clone() })
        .await;
    true
}

/// Announce, close and unregister a peer whose receive loop ended
async fn disconnect_peer(peer: &PeerHandle, shared: &Shared) {
    if announce_disconnect(peer, &shared.events).await {
        info!(peer = %peer.id(), addr = %peer.remote_addr(), "Peer disconnected");
    }

    // Already closed when kicked; the kicker joins this task
    if peer.close().await {
        debug!(peer = %peer.id(), "Transport closed");
    }
    shared.peers.lock().await.retain(|p| p != peer);
}

/// Close a peer of a dropped server
///
/// Nobody may be reading events any more, so the disconnect event is
/// emitted without waiting, and only for peers that were announced.
async fn teardown_peer(peer: &PeerHandle, shared: &Shared) {
    if peer.claim_disconnect() && peer.is_ready() {
        shared
            .events
            .try_emit(NetEvent::ClientDisconnected { peer: peer.clone() });
    }
    peer.close().await;
    shared.peers.lock().await.retain(|p| p != peer);
}
