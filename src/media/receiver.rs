//! Perpetual receive loop over one UDP socket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::net;

/// Sized to a typical MTU upper bound.
pub const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    Packet {
        /// The specific local address the datagram arrived on, even when
        /// the socket is bound to the wildcard.
        local: SocketAddr,
        remote: SocketAddr,
        payload: Vec<u8>,
    },
    Closed {
        reason: String,
    },
}

/// One bound UDP socket with a perpetual receive loop feeding a bounded
/// event queue. Each successful receive immediately re-arms the next;
/// the loop only ends through [`close`] or a fatal socket error.
///
/// [`close`]: UdpReceiver::close
#[derive(Debug)]
pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    events: mpsc::Sender<ReceiverEvent>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    started: AtomicBool,
}

impl UdpReceiver {
    pub fn new(socket: UdpSocket, queue: usize) -> Result<(Self, mpsc::Receiver<ReceiverEvent>)> {
        let local_addr = socket.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(queue.max(1));
        Ok((
            Self {
                socket: Arc::new(socket),
                local_addr,
                events: events_tx,
                cancel: CancellationToken::new(),
                closed: Arc::new(AtomicBool::new(false)),
                started: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Arm the receive loop. Subsequent calls are no-ops.
    pub fn begin_receive(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let socket = self.socket.clone();
        let local_addr = self.local_addr;
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = receive_one(&socket, &mut buf) => match result {
                        Ok(meta) => {
                            if meta.len == 0 {
                                debug!(local = %local_addr, "dropping zero-length datagram");
                                continue;
                            }
                            let local = meta
                                .destination
                                .map(|ip| SocketAddr::new(ip, local_addr.port()))
                                .unwrap_or(local_addr);
                            let event = ReceiverEvent::Packet {
                                local,
                                remote: meta.source,
                                payload: buf[..meta.len].to_vec(),
                            };
                            if let Err(err) = events.try_send(event) {
                                debug!(local = %local_addr, error = %err, "packet event queue full, dropping datagram");
                            }
                        }
                        Err(err) if is_transient(&err) => {
                            // Routine on UDP: the far side reset or is not
                            // listening yet, e.g. across a transfer.
                            info!(local = %local_addr, error = %err, "transient receive error, re-arming");
                        }
                        Err(err) => {
                            if cancel.is_cancelled() || closed.load(Ordering::SeqCst) {
                                // Disposed during a close race.
                                break;
                            }
                            warn!(local = %local_addr, error = %err, "fatal receive error, closing receiver");
                            if !closed.swap(true, Ordering::SeqCst) {
                                let _ = events.try_send(ReceiverEvent::Closed {
                                    reason: err.to_string(),
                                });
                            }
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stop the loop and report `Closed` exactly once. Idempotent.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let _ = self.events.try_send(ReceiverEvent::Closed {
            reason: reason.to_string(),
        });
    }

    /// Send a datagram out of this receiver's socket.
    pub(crate) async fn send_to(&self, payload: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(payload, dest).await
    }
}

async fn receive_one(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<net::RecvMeta> {
    loop {
        socket.readable().await?;
        match socket.try_io(Interest::READABLE, || net::recv_with_destination(socket, buf)) {
            Ok(meta) => return Ok(meta),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
