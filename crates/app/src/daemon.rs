//! Echo daemon
//!
//! Runs the configured handlers and echoes every payload back to whoever
//! sent it. Lifecycle and error events are logged.

use std::sync::Mutex;
use std::time::Duration;

use dotlink_core::Subscription;
use dotlink_net::{ConnectionState, NetEvent, NetEvents, TcpClient, TcpServer, UdpHandler};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{DaemonConfig, ProbeConfig};

/// How long shutdown waits for each background loop
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Echo subscriptions, taken before the handlers start
#[derive(Default)]
struct EchoSubscriptions {
    server: Option<Subscription<NetEvent>>,
    udp: Option<Subscription<NetEvent>>,
    probe: Option<Subscription<NetEvent>>,
}

/// Running handlers
pub struct Daemon {
    server: Option<TcpServer>,
    udp: Option<UdpHandler>,
    probe: Option<(TcpClient, String)>,
    subscriptions: Mutex<Option<EchoSubscriptions>>,
}

impl Daemon {
    /// Configure and start every handler in `config`
    ///
    /// Handlers whose configuration fails are logged and left out. Must be
    /// called inside a Tokio runtime, which runs the event loggers.
    pub fn start(config: &DaemonConfig) -> Self {
        let mut subs = EchoSubscriptions::default();

        let server = config.server.as_ref().and_then(|opts| {
            let events = logging_channel("server");
            let sub = events.subscribe();
            let server = TcpServer::configure(opts, events);
            server.start_listening().ok()?;
            subs.server = Some(sub);
            Some(server)
        });

        let udp = config.udp.as_ref().and_then(|opts| {
            let events = logging_channel("udp");
            let sub = events.subscribe();
            let udp = UdpHandler::configure(opts, events);
            udp.start_receiving().ok()?;
            subs.udp = Some(sub);
            Some(udp)
        });

        let probe = config.probe.as_ref().and_then(|ProbeConfig { target, greeting }| {
            let events = logging_channel("probe");
            let sub = events.subscribe();
            let client = TcpClient::configure(target, events);
            client.connect().ok()?;
            subs.probe = Some(sub);
            Some((client, greeting.clone()))
        });

        Daemon {
            server,
            udp,
            probe,
            subscriptions: Mutex::new(Some(subs)),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.server.is_none() && self.udp.is_none() && self.probe.is_none()
    }

    /// Echo until `stop` turns true
    ///
    /// Only the first call runs; later calls return at once.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let taken = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(EchoSubscriptions {
            server: mut server_events,
            udp: mut udp_events,
            probe: mut probe_events,
        }) = taken
        else {
            warn!("Daemon is already running");
            return;
        };

        loop {
            tokio::select! {
                Some(event) = next(&mut server_events) => self.on_server_event(event).await,
                Some(event) = next(&mut udp_events) => on_udp_event(event).await,
                Some(event) = next(&mut probe_events) => self.on_probe_event(event).await,
                _ = async { let _ = stop.wait_for(|s| *s).await; } => break,
            }
        }
    }

    /// Stop every handler
    pub async fn shutdown(&self) {
        if let Some(server) = &self.server {
            let _ = server.shutdown(Some(STOP_TIMEOUT)).await;
        }
        if let Some(udp) = &self.udp {
            let _ = udp.stop_receiving(Some(STOP_TIMEOUT)).await;
        }
        if let Some((client, _)) = &self.probe {
            if client.state() == ConnectionState::Connected {
                let _ = client.disconnect().await;
            }
        }
        info!("Daemon stopped");
    }

    async fn on_server_event(&self, event: NetEvent) {
        let Some(server) = &self.server else { return };
        if let NetEvent::MessageReceived(msg) = event {
            // Failures are already reported on the channel
            let _ = server.send(&msg.peer, &msg.data).await;
        }
    }

    async fn on_probe_event(&self, event: NetEvent) {
        let Some((client, greeting)) = &self.probe else { return };
        match event {
            NetEvent::Connected { .. } => {
                let _ = client.send(greeting.as_bytes()).await;
            }
            NetEvent::MessageReceived(msg) => {
                info!(reply = %String::from_utf8_lossy(&msg.data), "Probe got reply");
            }
            _ => {}
        }
    }
}

async fn on_udp_event(event: NetEvent) {
    if let NetEvent::MessageReceived(msg) = event {
        if let Err(e) = msg.peer.send(&msg.data).await {
            debug!(peer = %msg.peer, error = %e, "UDP echo failed");
        }
    }
}

/// Wait on an optional subscription; pends forever when absent
async fn next(sub: &mut Option<Subscription<NetEvent>>) -> Option<NetEvent> {
    match sub {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

/// Channel that logs every event under a handler name
///
/// The log subscription is taken before the handler is configured, so
/// configuration errors are logged too.
fn logging_channel(name: &'static str) -> NetEvents {
    let events = NetEvents::new();
    let mut sub = events.subscribe();
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            log_event(name, &event);
        }
    });
    events
}

fn log_event(handler: &str, event: &NetEvent) {
    match event {
        NetEvent::ListeningStarted { local_addr } => {
            info!(handler, addr = %local_addr, "Listening")
        }
        NetEvent::Connected { peer } | NetEvent::ClientConnected { peer } => {
            info!(handler, peer = %peer, "Connected")
        }
        NetEvent::Disconnected { peer } | NetEvent::ClientDisconnected { peer } => {
            info!(handler, peer = %peer, "Disconnected")
        }
        NetEvent::MessageReceived(msg) => {
            debug!(handler, peer = %msg.peer, bytes = msg.len(), "Message")
        }
        NetEvent::Error { kind, message } => {
            warn!(handler, kind = %kind, message = %message, "Handler error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotlink_core::SocketOptions;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UdpSocket};

    fn loopback() -> SocketOptions {
        SocketOptions::new("127.0.0.1", 0)
    }

    #[tokio::test]
    async fn test_tcp_and_udp_echo() {
        let config = DaemonConfig {
            server: Some(loopback()),
            udp: Some(loopback()),
            probe: None,
        };
        let daemon = std::sync::Arc::new(Daemon::start(&config));
        assert!(!daemon.is_idle());

        let tcp_addr = daemon.server.as_ref().unwrap().local_addr().unwrap();
        let udp_addr = daemon.udp.as_ref().unwrap().local_addr().unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run(stop_rx).await })
        };
        assert!(daemon.server.as_ref().unwrap().is_listening());

        let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
        stream.write_all(b"echo me").await.unwrap();
        let mut buf = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"echo me");

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(b"bounce", udp_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"bounce");
        assert_eq!(from, udp_addr);

        stop_tx.send(true).unwrap();
        runner.await.unwrap();
        daemon.shutdown().await;
        assert!(!daemon.server.as_ref().unwrap().is_listening());
    }

    #[tokio::test]
    async fn test_bad_section_is_left_out() {
        let config = DaemonConfig {
            server: Some(SocketOptions::new("127.0.0.1", 99999)),
            udp: None,
            probe: None,
        };
        let daemon = Daemon::start(&config);
        assert!(daemon.is_idle());
    }
}
