//! Frame channel boundary.
//!
//! A peer talks to its transport through a [`FrameSink`] for outbound frames
//! and an unbounded stream of [`ChannelEvent`]s for everything inbound. The
//! transport is responsible for framing; every event carries exactly one
//! complete frame.

use crate::error::ChannelError;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Inbound notifications from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The transport became ready. Only sent by channels that were not
    /// connected when handed to the peer.
    Connected,
    /// One complete frame.
    Frame(Bytes),
    /// The transport closed. Must also be sent after [`FrameSink::close`].
    Closed,
    /// The transport failed.
    Error(ChannelError),
}

/// Outbound half of a transport.
pub trait FrameSink: Send + Sync {
    /// Queues one frame. Must not block.
    fn send_frame(&self, frame: Bytes) -> Result<(), ChannelError>;

    /// Closes the transport. Idempotent.
    fn close(&self);
}

/// A transport as seen by a peer.
pub struct FrameChannel {
    pub sink: Arc<dyn FrameSink>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    /// Whether the transport is already usable. When false, the peer waits
    /// for [`ChannelEvent::Connected`] before sending its handshake.
    pub connected: bool,
}

impl FrameChannel {
    pub fn new(
        sink: Arc<dyn FrameSink>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        connected: bool,
    ) -> Self {
        Self {
            sink,
            events,
            connected,
        }
    }
}

impl std::fmt::Debug for FrameChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameChannel")
            .field("connected", &self.connected)
            .finish()
    }
}

/// In-process linked channel pair.
pub struct MemoryChannel;

impl MemoryChannel {
    /// Creates two connected endpoints. Frames sent on one arrive on the other.
    pub fn pair() -> (FrameChannel, FrameChannel) {
        let (a, b, _) = Self::build(true);
        (a, b)
    }

    /// Creates two endpoints that stay unconnected until
    /// [`MemoryConnector::connect`] is called.
    pub fn deferred_pair() -> (FrameChannel, FrameChannel, MemoryConnector) {
        Self::build(false)
    }

    fn build(connected: bool) -> (FrameChannel, FrameChannel, MemoryConnector) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let a_sink = MemorySink {
            own: a_tx.clone(),
            remote: b_tx.clone(),
            closed: Arc::clone(&closed),
        };
        let b_sink = MemorySink {
            own: b_tx.clone(),
            remote: a_tx.clone(),
            closed,
        };

        let connector = MemoryConnector { a: a_tx, b: b_tx };
        (
            FrameChannel::new(Arc::new(a_sink), a_rx, connected),
            FrameChannel::new(Arc::new(b_sink), b_rx, connected),
            connector,
        )
    }
}

struct MemorySink {
    own: mpsc::UnboundedSender<ChannelEvent>,
    remote: mpsc::UnboundedSender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl FrameSink for MemorySink {
    fn send_frame(&self, frame: Bytes) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.remote
            .send(ChannelEvent::Frame(frame))
            .map_err(|_| ChannelError::Closed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.own.send(ChannelEvent::Closed);
        let _ = self.remote.send(ChannelEvent::Closed);
    }
}

/// Completes a [`MemoryChannel::deferred_pair`].
pub struct MemoryConnector {
    a: mpsc::UnboundedSender<ChannelEvent>,
    b: mpsc::UnboundedSender<ChannelEvent>,
}

impl MemoryConnector {
    pub fn connect(self) {
        let _ = self.a.send(ChannelEvent::Connected);
        let _ = self.b.send(ChannelEvent::Connected);
    }

    /// Fails both endpoints instead of connecting them.
    pub fn fail(self, reason: impl Into<String>) {
        let reason = reason.into();
        let _ = self
            .a
            .send(ChannelEvent::Error(ChannelError::Transport(reason.clone())));
        let _ = self.b.send(ChannelEvent::Error(ChannelError::Transport(reason)));
    }
}
