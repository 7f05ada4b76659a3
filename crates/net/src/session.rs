//! Plumbing shared by the handlers
//!
//! The stream receive loop used by every server peer and by the client, and
//! the helpers for spawning and stopping background tasks.

use std::io;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{report, Error, ErrorKind, Result};
use crate::event::{NetEvent, NetEvents};
use crate::peer::{InboundMessage, PeerHandle};

/// Why a stream receive loop ended
#[derive(Debug)]
pub(crate) enum LoopExit {
    /// Remote side closed the connection
    Eof,
    /// Read failed; treated as a disconnect, not an error
    Failed(io::Error),
    /// Local side closed the transport
    Closed,
}

/// Read from a stream until it ends
///
/// Emits one [`NetEvent::MessageReceived`] per non-empty read, before the
/// next read is issued. A subscriber that stops reading events stops this
/// loop from reading, which leaves the data in the socket buffers. The
/// caller runs the disconnect sequence.
pub(crate) async fn receive_loop(
    mut reader: OwnedReadHalf,
    peer: &PeerHandle,
    mut closed: watch::Receiver<bool>,
    buffer_size: usize,
    events: &NetEvents,
) -> LoopExit {
    let mut buf = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!(peer = %peer.id(), "Connection closed by remote");
                        return LoopExit::Eof;
                    }
                    Ok(n) => {
                        let event = NetEvent::MessageReceived(InboundMessage::new(peer.clone(), &buf[..n]));
                        // Next read waits until every subscriber has room
                        tokio::select! {
                            _ = events.emit(event) => {}
                            _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                                debug!(peer = %peer.id(), "Connection closed while delivering");
                                return LoopExit::Closed;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer.id(), error = %e, "Read error");
                        return LoopExit::Failed(e);
                    }
                }
            }
            _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                debug!(peer = %peer.id(), "Connection closed locally");
                return LoopExit::Closed;
            }
        }
    }
}

/// Handle of the current Tokio runtime, reported as `kind` when missing
pub(crate) fn runtime(events: &NetEvents, kind: ErrorKind) -> Result<Handle> {
    Handle::try_current().map_err(|_| {
        report(
            events,
            Error::new(kind, "background tasks need a running Tokio runtime"),
        )
    })
}

/// Wait for a background task to exit
///
/// With a timeout, a task that does not finish in time is aborted.
/// Returns `false` in that case.
pub(crate) async fn join_task(mut handle: JoinHandle<()>, timeout: Option<Duration>) -> bool {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "Task did not stop in time, aborting");
                handle.abort();
                false
            }
        },
        None => {
            let _ = handle.await;
            true
        }
    }
}
