//! Two-socket UDP endpoint for one media session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::receiver::{is_transient, ReceiverEvent, UdpReceiver};
use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::net;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Media,
    Control,
}

/// Per-send result. A failed send never tears the channel down; fatal
/// conditions only surface through [`ChannelEvent::Closed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The channel is closed or closing; nothing was transmitted.
    Disconnecting,
    /// Routine socket error, carries the OS error code.
    Transient(i32),
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Rtp {
        remote: SocketAddr,
        payload: Vec<u8>,
    },
    Control {
        remote: SocketAddr,
        payload: Vec<u8>,
    },
    Closed {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
}

/// RTP media channel: a media socket and an optional control socket bound
/// on an even/odd port pair inside the configured range, each driven by a
/// [`UdpReceiver`], with a fire-and-forget send path.
#[derive(Debug, Clone)]
pub struct RtpChannel {
    inner: Arc<ChannelInner>,
}

#[derive(Debug)]
struct ChannelInner {
    media: UdpReceiver,
    control: Option<UdpReceiver>,
    media_events: Mutex<Option<mpsc::Receiver<ReceiverEvent>>>,
    control_events: Mutex<Option<mpsc::Receiver<ReceiverEvent>>>,
    events: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
    closed: AtomicBool,
    started: AtomicBool,
    remote_media: Mutex<Option<SocketAddr>>,
    remote_control: Mutex<Option<SocketAddr>>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl RtpChannel {
    /// Bind a media socket (and, unless multiplexed, a control socket on
    /// the next odd port) walking the configured range two ports at a
    /// time.
    pub fn bind(config: &ChannelConfig) -> Result<(Self, mpsc::Receiver<ChannelEvent>)> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::channel(config.event_queue);

        let mut port = config.port_range.min;
        loop {
            match Self::bind_pair(config, port) {
                Ok((media, control)) => {
                    let (media, media_events) = UdpReceiver::new(media, config.event_queue)?;
                    let (control, control_events) = match control {
                        Some(socket) => {
                            let (receiver, events) =
                                UdpReceiver::new(socket, config.event_queue)?;
                            (Some(receiver), Some(events))
                        }
                        None => (None, None),
                    };
                    debug!(media = %media.local_addr(), control = ?control.as_ref().map(UdpReceiver::local_addr), "rtp channel bound");
                    let inner = ChannelInner {
                        media,
                        control,
                        media_events: Mutex::new(Some(media_events)),
                        control_events: Mutex::new(control_events),
                        events: events_tx,
                        cancel: CancellationToken::new(),
                        closed: AtomicBool::new(false),
                        started: AtomicBool::new(false),
                        remote_media: Mutex::new(None),
                        remote_control: Mutex::new(None),
                        packets_sent: AtomicU64::new(0),
                        bytes_sent: AtomicU64::new(0),
                        packets_received: AtomicU64::new(0),
                        bytes_received: AtomicU64::new(0),
                    };
                    return Ok((
                        Self {
                            inner: Arc::new(inner),
                        },
                        events_rx,
                    ));
                }
                Err(err) => {
                    debug!(port, error = %err, "media port pair unavailable");
                    let next = port.saturating_add(2);
                    if next > config.port_range.max || next < port {
                        return Err(Error::Media(format!(
                            "no free media port pair in {}..={}",
                            config.port_range.min, config.port_range.max
                        )));
                    }
                    port = next;
                }
            }
        }
    }

    fn bind_pair(
        config: &ChannelConfig,
        port: u16,
    ) -> Result<(tokio::net::UdpSocket, Option<tokio::net::UdpSocket>)> {
        let media = net::bind_udp_socket(&config.bind, port)?;
        let control = if config.create_control_socket {
            Some(net::bind_udp_socket(&config.bind, port.saturating_add(1))?)
        } else {
            None
        };
        Ok((media, control))
    }

    /// Arm both receive loops and the event fan-in. Subsequent calls are
    /// no-ops.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.media.begin_receive();
        if let Some(control) = &self.inner.control {
            control.begin_receive();
        }

        let mut media_events = self
            .inner
            .media_events
            .lock()
            .expect("media event queue lock")
            .take();
        let mut control_events = self
            .inner
            .control_events
            .lock()
            .expect("control event queue lock")
            .take();

        let fan_in = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = fan_in.cancel.cancelled() => break,
                    event = next_event(&mut media_events) => {
                        match event {
                            Some(event) => {
                                if fan_in.dispatch(event, PacketKind::Media).await {
                                    break;
                                }
                            }
                            None => media_events = None,
                        }
                    }
                    event = next_event(&mut control_events) => {
                        match event {
                            Some(event) => {
                                if fan_in.dispatch(event, PacketKind::Control).await {
                                    break;
                                }
                            }
                            None => control_events = None,
                        }
                    }
                }
            }
        });
    }

    /// Commit a datagram to the OS transmit queue. Completion only feeds
    /// counters and the per-send outcome.
    pub async fn send(
        &self,
        kind: PacketKind,
        dest: SocketAddr,
        payload: &[u8],
    ) -> Result<SendOutcome> {
        if payload.is_empty() {
            return Err(Error::invalid_argument("send buffer is empty"));
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(SendOutcome::Disconnecting);
        }

        let receiver = match kind {
            PacketKind::Media => &self.inner.media,
            // Multiplexed channels carry control traffic on the media socket.
            PacketKind::Control => self.inner.control.as_ref().unwrap_or(&self.inner.media),
        };

        match receiver.send_to(payload, dest).await {
            Ok(sent) => {
                self.inner.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                Ok(SendOutcome::Sent)
            }
            Err(err) => {
                if self.inner.closed.load(Ordering::SeqCst) {
                    return Ok(SendOutcome::Disconnecting);
                }
                if is_transient(&err) {
                    info!(?kind, %dest, error = %err, "transient send error");
                    Ok(SendOutcome::Transient(err.raw_os_error().unwrap_or(0)))
                } else {
                    warn!(?kind, %dest, error = %err, "send fault");
                    Ok(SendOutcome::Fault)
                }
            }
        }
    }

    /// Shut down both receivers and report `Closed` exactly once.
    /// Idempotent; all later sends return [`SendOutcome::Disconnecting`].
    pub async fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(media = %self.media_addr(), reason, "closing rtp channel");
        self.inner.cancel.cancel();
        self.inner.media.close(reason).await;
        if let Some(control) = &self.inner.control {
            control.close(reason).await;
        }
        let _ = self.inner.events.try_send(ChannelEvent::Closed {
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn media_addr(&self) -> SocketAddr {
        self.inner.media.local_addr()
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.inner.control.as_ref().map(UdpReceiver::local_addr)
    }

    /// Last-seen remote media endpoint, for reporting only.
    pub fn remote_media_endpoint(&self) -> Option<SocketAddr> {
        *self.inner.remote_media.lock().expect("remote media lock")
    }

    /// Last-seen remote control endpoint, for reporting only.
    pub fn remote_control_endpoint(&self) -> Option<SocketAddr> {
        *self
            .inner
            .remote_control
            .lock()
            .expect("remote control lock")
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            packets_sent: self.inner.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.inner.packets_received.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl ChannelInner {
    /// Returns true when the fan-in loop should stop.
    async fn dispatch(&self, event: ReceiverEvent, kind: PacketKind) -> bool {
        match event {
            ReceiverEvent::Packet {
                remote, payload, ..
            } => {
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                self.bytes_received
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                let (cell, event) = match kind {
                    PacketKind::Media => (
                        &self.remote_media,
                        ChannelEvent::Rtp { remote, payload },
                    ),
                    PacketKind::Control => (
                        &self.remote_control,
                        ChannelEvent::Control { remote, payload },
                    ),
                };
                cell.lock().expect("remote endpoint lock").replace(remote);
                if let Err(err) = self.events.try_send(event) {
                    debug!(error = %err, "channel event queue full, dropping packet");
                }
                false
            }
            ReceiverEvent::Closed { reason } => {
                // A receiver died underneath us; take the whole channel
                // down once.
                if !self.closed.swap(true, Ordering::SeqCst) {
                    warn!(reason, "receiver closed, closing rtp channel");
                    self.media.close(&reason).await;
                    if let Some(control) = &self.control {
                        control.close(&reason).await;
                    }
                    let _ = self.events.try_send(ChannelEvent::Closed { reason });
                }
                true
            }
        }
    }
}

async fn next_event(queue: &mut Option<mpsc::Receiver<ReceiverEvent>>) -> Option<ReceiverEvent> {
    match queue {
        Some(queue) => queue.recv().await,
        None => std::future::pending().await,
    }
}
