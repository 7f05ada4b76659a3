//! UDP handler
//!
//! Binds one datagram socket, runs a single receive task for every inbound
//! packet and sends to one or many recipients. Each received packet gets a
//! fresh [`PeerHandle`] for its source address; those handles are never
//! registered anywhere and do not keep the socket open.
//!
//! The socket is bound when the handler is configured and handed to the
//! Tokio runtime on first use.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use dotlink_core::{parse_endpoint, validate_port, SocketOptions, Subscription, ValidatedOptions};

use crate::error::{fail, report, Error, ErrorKind, Result};
use crate::event::{NetEvent, NetEvents};
use crate::peer::{InboundMessage, PeerHandle};
use crate::session::{join_task, runtime};

/// Bound socket, before and after it is registered with the runtime
enum Bound {
    Std(std::net::UdpSocket),
    Runtime(Arc<UdpSocket>),
}

struct ReceiveTask {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// UDP handler
pub struct UdpHandler {
    options: Option<ValidatedOptions>,
    local_addr: Option<SocketAddr>,
    /// Taken when receiving stops, which closes the handler
    socket: Mutex<Option<Bound>>,
    receive_task: Mutex<Option<ReceiveTask>>,
    events: NetEvents,
}

impl UdpHandler {
    /// Validate the options and bind the socket
    ///
    /// Needs no runtime; the socket joins one on first use. Bad options are reported on `events` as `BadAddress`, `BadPort` or
    /// `BadBufferSize`, a taken port as `BindFailed`. The handler is then
    /// unusable and later operations report `SocketNotCreated`.
    pub fn configure(options: &SocketOptions, events: NetEvents) -> Self {
        let mut handler = UdpHandler {
            options: None,
            local_addr: None,
            socket: Mutex::new(None),
            receive_task: Mutex::new(None),
            events,
        };

        let validated = match options.validate() {
            Ok(v) => v,
            Err(e) => {
                report(&handler.events, e);
                return handler;
            }
        };

        let socket = match bind_socket(&validated) {
            Ok(s) => s,
            Err(e) => {
                report(
                    &handler.events,
                    Error::io(
                        ErrorKind::BindFailed,
                        format!("cannot bind {}, probably another application uses this port", validated.addr),
                        e,
                    ),
                );
                return handler;
            }
        };

        handler.local_addr = socket.local_addr().ok();
        info!(addr = ?handler.local_addr, "UDP socket bound");

        handler.options = Some(validated);
        *handler.socket.get_mut().unwrap_or_else(|e| e.into_inner()) = Some(Bound::Std(socket));
        handler
    }

    pub fn is_configured(&self) -> bool {
        self.options.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn events(&self) -> &NetEvents {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription<NetEvent> {
        self.events.subscribe()
    }

    /// Start receiving datagrams in the background
    ///
    /// Returns immediately. A receive failure is reported as
    /// `ReceivingFailed` and ends the receive task; it is not restarted.
    pub fn start_receiving(&self) -> Result<()> {
        let Some(options) = self.options else {
            return fail(&self.events, ErrorKind::SocketNotCreated, "handler is not configured");
        };

        let mut task = lock(&self.receive_task);
        if task.is_some() {
            return fail(&self.events, ErrorKind::BadParameter, "handler is already receiving");
        }

        let rt = runtime(&self.events, ErrorKind::ReceivingFailed)?;
        let socket = self.socket()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = rt.spawn(receive_loop(
            socket,
            options.buffer_size,
            self.events.clone(),
            shutdown_rx,
        ));
        *task = Some(ReceiveTask { shutdown_tx, handle });
        Ok(())
    }

    /// Stop receiving and close the socket
    ///
    /// Later sends report `SocketNotCreated`. With a timeout, a receive task
    /// that does not exit in time is aborted. The port is free once this
    /// returns, even if peers of received messages are still around; their
    /// replies fail from then on.
    pub async fn stop_receiving(&self, timeout: Option<Duration>) -> Result<()> {
        if self.options.is_none() {
            return fail(&self.events, ErrorKind::SocketNotCreated, "handler is not configured");
        }

        drop(lock(&self.socket).take());

        let task = lock(&self.receive_task).take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(());
            join_task(task.handle, timeout).await;
            info!(addr = ?self.local_addr, "UDP handler stopped receiving");
        }
        Ok(())
    }

    /// Whether the receive task is running
    pub fn is_receiving(&self) -> bool {
        lock(&self.receive_task)
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Send one datagram
    pub async fn send(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        let socket = self.socket()?;
        match socket.send_to(data, target).await {
            Ok(n) => {
                trace!(bytes = n, target = %target, "Datagram sent");
                Ok(())
            }
            Err(e) => Err(report(
                &self.events,
                Error::io(
                    ErrorKind::SendingMessageFailed,
                    format!("error while sending message to {}", target),
                    e,
                ),
            )),
        }
    }

    /// Send one datagram to an IP and a port that still needs checking
    pub async fn send_to_ip(&self, ip: IpAddr, port: i32, data: &[u8]) -> Result<()> {
        let port = validate_port(port).map_err(|e| report(&self.events, e))?;
        self.send(SocketAddr::new(ip, port), data).await
    }

    /// Send one datagram to a textual address
    pub async fn send_to_str(&self, address: &str, port: i32, data: &[u8]) -> Result<()> {
        let target = parse_endpoint(address, port).map_err(|e| report(&self.events, e))?;
        self.send(target, data).await
    }

    /// Send the same datagram to every recipient
    ///
    /// Best effort: a failing recipient is skipped silently. Returns how many
    /// datagrams were handed to the OS.
    pub async fn send_to_many(&self, targets: &[SocketAddr], data: &[u8]) -> usize {
        let socket = match self.socket() {
            Ok(s) => s,
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for target in targets {
            match socket.send_to(data, *target).await {
                Ok(_) => delivered += 1,
                Err(e) => debug!(target = %target, error = %e, "Datagram to recipient failed"),
            }
        }
        delivered
    }

    /// Send the same datagram to every IP on one port
    pub async fn send_to_many_ips(&self, ips: &[IpAddr], port: u16, data: &[u8]) -> usize {
        let targets: Vec<SocketAddr> = ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect();
        self.send_to_many(&targets, data).await
    }

    /// Send the same datagram to every textual address on one port
    ///
    /// Addresses that do not parse are skipped like unreachable ones.
    pub async fn send_to_many_strs<S: AsRef<str>>(&self, addresses: &[S], port: i32, data: &[u8]) -> usize {
        let targets: Vec<SocketAddr> = addresses
            .iter()
            .filter_map(|a| match parse_endpoint(a.as_ref(), port) {
                Ok(t) => Some(t),
                Err(e) => {
                    debug!(error = %e, "Skipping recipient");
                    None
                }
            })
            .collect();
        self.send_to_many(&targets, data).await
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        if self.options.is_none() {
            return fail(&self.events, ErrorKind::SocketNotCreated, "handler is not configured");
        }

        let mut slot = lock(&self.socket);
        let socket = match slot.take() {
            Some(Bound::Runtime(socket)) => socket,
            Some(Bound::Std(socket)) => {
                let rt = match runtime(&self.events, ErrorKind::SocketNotCreated) {
                    Ok(rt) => rt,
                    Err(e) => {
                        *slot = Some(Bound::Std(socket));
                        return Err(e);
                    }
                };
                let _enter = rt.enter();
                match UdpSocket::from_std(socket) {
                    Ok(socket) => Arc::new(socket),
                    Err(e) => {
                        return Err(report(
                            &self.events,
                            Error::io(ErrorKind::SocketNotCreated, "cannot register socket with the runtime", e),
                        ))
                    }
                }
            }
            None => return fail(&self.events, ErrorKind::SocketNotCreated, "socket was closed"),
        };
        *slot = Some(Bound::Runtime(Arc::clone(&socket)));
        Ok(socket)
    }
}

impl Drop for UdpHandler {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.receive_task).take() {
            let _ = task.shutdown_tx.send(());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bind a non-blocking socket with broadcast enabled
fn bind_socket(options: &ValidatedOptions) -> io::Result<std::net::UdpSocket> {
    let socket = std::net::UdpSocket::bind(options.addr)?;
    socket.set_nonblocking(true)?;
    if let Err(e) = socket.set_broadcast(true) {
        debug!(error = %e, "Could not enable broadcast");
    }
    Ok(socket)
}

/// Receive datagrams until shutdown or the first receive failure
async fn receive_loop(
    socket: Arc<UdpSocket>,
    buffer_size: usize,
    events: NetEvents,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    match socket.local_addr() {
        Ok(local_addr) => {
            info!(addr = %local_addr, "UDP receive loop started");
            events.emit(NetEvent::ListeningStarted { local_addr }).await;
        }
        Err(e) => {
            report(&events, Error::io(ErrorKind::ReceivingFailed, "socket has no local address", e));
            return;
        }
    }

    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => {
                        trace!(bytes = n, from = %from, "Datagram received");
                        let peer = PeerHandle::datagram(from, &socket);
                        let event = NetEvent::MessageReceived(InboundMessage::new(peer, &buf[..n]));
                        // Next receive waits until every subscriber has room
                        tokio::select! {
                            _ = events.emit(event) => {}
                            _ = shutdown_rx.recv() => {
                                debug!("UDP receive loop shutting down");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        report(&events, Error::io(ErrorKind::ReceivingFailed, "error while receiving", e));
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("UDP receive loop shutting down");
                break;
            }
        }
    }
}
