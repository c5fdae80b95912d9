//! Fan-out of wire frames to the peers of one session.
//!
//! Built on a tokio broadcast channel carrying pre-encoded frames. Every
//! frame is tagged with the connection id of its sender so receivers can
//! skip their own traffic; the hub's locally originated frames use
//! [`HUB_SENDER`], which never matches a connection.
//!
//! Backpressure: a receiver that lags behind `capacity` frames observes
//! `RecvError::Lagged`; the owning connection closes itself and the peer
//! resyncs from its state vector on reconnect. The broadcast itself never
//! blocks on a slow peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Sender id used for frames originated by the hub itself.
pub const HUB_SENDER: u64 = 0;

/// A frame queued for fan-out, tagged with its origin connection.
#[derive(Debug)]
pub struct SessionFrame {
    pub sender_id: u64,
    pub bytes: Vec<u8>,
}

/// Statistics snapshot for one session channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub receiver_count: usize,
}

/// Broadcast channel shared by all connections of one session.
pub struct SessionChannel {
    sender: broadcast::Sender<Arc<SessionFrame>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl SessionChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionFrame>> {
        self.sender.subscribe()
    }

    /// Queue a frame for every subscriber. Returns the number of receivers
    /// it reached (zero when nobody is connected).
    pub fn send(&self, sender_id: u64, bytes: Vec<u8>) -> usize {
        let frame = Arc::new(SessionFrame { sender_id, bytes });
        let reached = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        reached
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            receiver_count: self.sender.receiver_count(),
        }
    }
}
