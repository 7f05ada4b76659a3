//! TCP client handler
//!
//! Connects to one server in the background and runs a single receive task
//! for that connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use dotlink_core::{SocketOptions, Subscription, ValidatedOptions};

use crate::error::{fail, report, Error, ErrorKind, Result};
use crate::event::{NetEvent, NetEvents};
use crate::peer::PeerHandle;
use crate::session::{receive_loop, runtime};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct ClientState {
    connection: ConnectionState,
    peer: Option<PeerHandle>,
    task: Option<JoinHandle<()>>,
}

/// TCP client handle
pub struct TcpClient {
    options: Option<ValidatedOptions>,
    events: NetEvents,
    state: Arc<Mutex<ClientState>>,
}

impl TcpClient {
    /// Validate the target address
    ///
    /// Bad options are reported on `events`; the client is then unusable and
    /// later operations report `SocketNotCreated`.
    pub fn configure(options: &SocketOptions, events: NetEvents) -> Self {
        let options = match options.validate() {
            Ok(v) => Some(v),
            Err(e) => {
                report(&events, e);
                None
            }
        };

        TcpClient {
            options,
            events,
            state: Arc::new(Mutex::new(ClientState {
                connection: ConnectionState::Disconnected,
                peer: None,
                task: None,
            })),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.options.is_some()
    }

    /// Address the client connects to
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.options.map(|o| o.addr)
    }

    pub fn events(&self) -> &NetEvents {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription<NetEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    /// Handle of the current connection, or of the last one once it closed
    ///
    /// `None` until the client has connected.
    pub fn peer(&self) -> Option<PeerHandle> {
        lock(&self.state).peer.clone()
    }

    /// Connect in the background
    ///
    /// Returns immediately. Emits `Connected` and starts receiving on
    /// success, or reports `ConnectingFailed`.
    pub fn connect(&self) -> Result<()> {
        let Some(options) = self.options else {
            return fail(&self.events, ErrorKind::SocketNotCreated, "client is not configured");
        };

        let rt = runtime(&self.events, ErrorKind::ConnectingFailed)?;

        let mut state = lock(&self.state);
        if state.connection != ConnectionState::Disconnected {
            drop(state);
            return fail(
                &self.events,
                ErrorKind::BadParameter,
                "client is already connecting or connected",
            );
        }
        state.connection = ConnectionState::Connecting;

        info!(addr = %options.addr, "Connecting to server");
        let handle = rt.spawn(connection_task(options, self.events.clone(), self.state.clone()));
        state.task = Some(handle);
        Ok(())
    }

    /// Close the connection
    ///
    /// Emits `Disconnected` before the transport is closed and waits for the
    /// receive task to end. Reports `DisconnectingFailed` when there is no
    /// open connection.
    pub async fn disconnect(&self) -> Result<()> {
        if self.options.is_none() {
            return fail(&self.events, ErrorKind::SocketNotCreated, "client is not configured");
        }

        let (peer, task) = {
            let mut state = lock(&self.state);
            match state.peer.clone() {
                Some(peer) => (peer, state.task.take()),
                None => {
                    drop(state);
                    return fail(&self.events, ErrorKind::DisconnectingFailed, "client is not connected");
                }
            }
        };

        peer.ready().await;
        if peer.claim_disconnect() {
            self.events
                .emit(NetEvent::Disconnected { peer: peer.clone() })
                .await;
        }
        if !peer.close().await {
            return fail(&self.events, ErrorKind::DisconnectingFailed, "connection was already closed");
        }

        if let Some(task) = task {
            let _ = task.await;
        }
        info!(addr = %peer.remote_addr(), "Disconnected from server");
        Ok(())
    }

    /// Send data to the server
    ///
    /// Reports `SocketNotCreated` before the first connection and
    /// `SendingMessageFailed` once that connection is closed.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.options.is_none() {
            return fail(&self.events, ErrorKind::SocketNotCreated, "client is not configured");
        }

        let Some(peer) = self.peer() else {
            return fail(&self.events, ErrorKind::SocketNotCreated, "client has never connected");
        };

        peer.send(data).await.map_err(|e| {
            report(
                &self.events,
                Error::io(ErrorKind::SendingMessageFailed, "error while sending message", e),
            )
        })
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.state).task.take() {
            task.abort();
        }
    }
}

fn lock(state: &Mutex<ClientState>) -> MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Connect, then receive until the connection ends
async fn connection_task(options: ValidatedOptions, events: NetEvents, state: Arc<Mutex<ClientState>>) {
    let stream = match TcpStream::connect(options.addr).await {
        Ok(s) => s,
        Err(e) => {
            lock(&state).connection = ConnectionState::Disconnected;
            report(
                &events,
                Error::io(
                    ErrorKind::ConnectingFailed,
                    format!("connecting to {} failed", options.addr),
                    e,
                ),
            );
            return;
        }
    };

    let remote = stream.peer_addr().unwrap_or(options.addr);
    let (reader, writer) = stream.into_split();
    let (peer, closed) = PeerHandle::stream(remote, writer);

    {
        let mut s = lock(&state);
        s.connection = ConnectionState::Connected;
        s.peer = Some(peer.clone());
    }
    info!(addr = %remote, "Connected to server");
    events.emit(NetEvent::Connected { peer: peer.clone() }).await;
    peer.mark_ready();

    let exit = receive_loop(reader, &peer, closed, options.buffer_size, &events).await;
    debug!(exit = ?exit, "Receive loop ended");

    if peer.claim_disconnect() {
        events.emit(NetEvent::Disconnected { peer: peer.clone() }).await;
        info!(addr = %remote, "Server closed the connection");
    }
    peer.close().await;

    // The closed handle stays, so later sends fail as sends
    lock(&state).connection = ConnectionState::Disconnected;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::server::TcpServer;
    use crate::test_util::{expect_no_event, next_event, wait_for};

    async fn connected_client(addr: SocketAddr) -> (TcpClient, Subscription<NetEvent>, PeerHandle) {
        let events = NetEvents::new();
        let mut sub = events.subscribe();
        let client = TcpClient::configure(
            &SocketOptions::new(addr.ip().to_string(), addr.port() as i32),
            events,
        );
        client.connect().unwrap();
        let peer = match next_event(&mut sub).await {
            NetEvent::Connected { peer } => peer,
            other => panic!("Expected Connected, got {:?}", other),
        };
        (client, sub, peer)
    }

    #[tokio::test]
    async fn test_client_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, _sub, peer) = connected_client(addr).await;
        let (_conn, _) = listener.accept().await.unwrap();

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(peer.remote_addr(), addr);
        assert_eq!(client.peer(), Some(peer));
    }

    #[tokio::test]
    async fn test_connect_refused_reports_connecting_failed() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let events = NetEvents::new();
        let mut sub = events.subscribe();
        let client = TcpClient::configure(&SocketOptions::new("127.0.0.1", addr.port() as i32), events);
        client.connect().unwrap();

        assert_eq!(
            next_event(&mut sub).await.error_kind(),
            Some(ErrorKind::ConnectingFailed)
        );
        expect_no_event(&mut sub).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_bad_port_never_connects() {
        let events = NetEvents::new();
        let mut sub = events.subscribe();
        let client = TcpClient::configure(&SocketOptions::new("127.0.0.1", 65536), events);

        assert_eq!(next_event(&mut sub).await.error_kind(), Some(ErrorKind::BadPort));
        assert!(!client.is_configured());
        assert_eq!(client.connect().unwrap_err().kind(), ErrorKind::SocketNotCreated);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let events = NetEvents::new();
        let mut sub = events.subscribe();
        let client = TcpClient::configure(&SocketOptions::new("127.0.0.1", 7000), events);

        let err = client.send(b"too early").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SocketNotCreated);
        assert_eq!(
            next_event(&mut sub).await.error_kind(),
            Some(ErrorKind::SocketNotCreated)
        );
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let client = TcpClient::configure(&SocketOptions::new("127.0.0.1", 7000), NetEvents::new());
        let err = client.disconnect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisconnectingFailed);
    }

    #[tokio::test]
    async fn test_roundtrip_with_server() {
        let server_events = NetEvents::new();
        let mut server_sub = server_events.subscribe();
        let server = TcpServer::configure(&SocketOptions::new("127.0.0.1", 0), server_events);
        server.start_listening().unwrap();
        let addr = server.local_addr().unwrap();
        wait_for(&mut server_sub, |e| matches!(e, NetEvent::ListeningStarted { .. })).await;

        let (client, mut sub, _peer) = connected_client(addr).await;
        let server_peer = match next_event(&mut server_sub).await {
            NetEvent::ClientConnected { peer } => peer,
            other => panic!("Expected ClientConnected, got {:?}", other),
        };

        for n in [1usize, 100, 8192] {
            let payload: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            client.send(&payload).await.unwrap();

            let mut received = Vec::new();
            while received.len() < n {
                match next_event(&mut server_sub).await {
                    NetEvent::MessageReceived(msg) => received.extend_from_slice(&msg.data),
                    other => panic!("Expected message, got {:?}", other),
                }
            }
            assert_eq!(received, payload);
        }

        server.send(&server_peer, b"reply").await.unwrap();
        match next_event(&mut sub).await {
            NetEvent::MessageReceived(msg) => assert_eq!(&msg.data[..], b"reply"),
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_small_message_arrives_whole() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_client, mut sub, _peer) = connected_client(listener.local_addr().unwrap()).await;
        let (mut conn, _) = listener.accept().await.unwrap();

        conn.write_all(b"0123456789").await.unwrap();
        match next_event(&mut sub).await {
            NetEvent::MessageReceived(msg) => {
                assert_eq!(msg.len(), 10);
                assert_eq!(&msg.data[..], b"0123456789");
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_close_emits_disconnected_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, mut sub, peer) = connected_client(listener.local_addr().unwrap()).await;
        let (conn, _) = listener.accept().await.unwrap();

        drop(conn);
        match next_event(&mut sub).await {
            NetEvent::Disconnected { peer: gone } => assert_eq!(gone, peer),
            other => panic!("Expected Disconnected, got {:?}", other),
        }
        expect_no_event(&mut sub).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.peer(), Some(peer.clone()));
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_send_after_server_close_reports_sending_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, mut sub, _peer) = connected_client(listener.local_addr().unwrap()).await;
        let (conn, _) = listener.accept().await.unwrap();

        drop(conn);
        wait_for(&mut sub, |e| matches!(e, NetEvent::Disconnected { .. })).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = client.send(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SendingMessageFailed);
        assert_eq!(
            next_event(&mut sub).await.error_kind(),
            Some(ErrorKind::SendingMessageFailed)
        );
    }

    #[tokio::test]
    async fn test_reconnect_replaces_closed_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, mut sub, first) = connected_client(listener.local_addr().unwrap()).await;
        let (conn, _) = listener.accept().await.unwrap();
        drop(conn);
        wait_for(&mut sub, |e| matches!(e, NetEvent::Disconnected { .. })).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.connect().unwrap();
        let second = match next_event(&mut sub).await {
            NetEvent::Connected { peer } => peer,
            other => panic!("Expected Connected, got {:?}", other),
        };
        let (mut conn, _) = listener.accept().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(client.peer(), Some(second));

        client.send(b"again").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
    }

    #[tokio::test]
    async fn test_disconnect_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, mut sub, _peer) = connected_client(listener.local_addr().unwrap()).await;
        let (mut conn, _) = listener.accept().await.unwrap();

        client.disconnect().await.unwrap();
        assert!(matches!(next_event(&mut sub).await, NetEvent::Disconnected { .. }));
        expect_no_event(&mut sub).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let mut buf = [0u8; 1];
        assert_eq!(conn.read(&mut buf).await.unwrap_or(0), 0);

        // Connection is gone, a second disconnect fails
        let err = client.disconnect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisconnectingFailed);
    }
}
