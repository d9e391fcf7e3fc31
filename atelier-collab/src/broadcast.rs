//! Outbound event fan-out.
//!
//! The core never talks to a transport directly: every outward-facing event
//! goes through the [`BroadcastSink`] port. [`ChannelBroadcaster`] is the
//! in-process implementation — a tokio broadcast channel fanning pre-encoded
//! bytes out to N subscribers with per-receiver buffering — and tests use
//! [`RecordingSink`].
//!
//! Stats are tracked via atomics so publishing never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::error::CollabError;
use crate::protocol::CollabMessage;

/// Anything that can push collaboration events outward.
///
/// Returns how many receivers saw the event. A deployment wires this to a
/// real transport; the core only guarantees the events and payloads.
pub trait BroadcastSink: Send + Sync {
    fn publish(&self, message: &CollabMessage) -> Result<usize, CollabError>;
}

/// Snapshot of broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_published: u64,
    pub active_receivers: usize,
}

/// Tokio-broadcast fan-out with lock-free stats.
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    published: AtomicU64,
    capacity: usize,
}

impl ChannelBroadcaster {
    /// `capacity` bounds how many messages a lagging receiver may buffer
    /// before it starts missing them (backpressure).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
            capacity,
        }
    }

    /// Subscribe a new receiver to this document's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Publish pre-encoded bytes directly (zero-copy fast path).
    pub fn publish_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.published.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_published: self.published.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl BroadcastSink for ChannelBroadcaster {
    fn publish(&self, message: &CollabMessage) -> Result<usize, CollabError> {
        let encoded = message.encode()?;
        Ok(self.publish_raw(Arc::new(encoded)))
    }
}

/// Test sink that remembers every published message.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<CollabMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<CollabMessage> {
        self.messages.lock().expect("sink poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().expect("sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BroadcastSink for RecordingSink {
    fn publish(&self, message: &CollabMessage) -> Result<usize, CollabError> {
        self.messages.lock().expect("sink poisoned").push(message.clone());
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use atelier_core::Point3D;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let broadcaster = ChannelBroadcaster::new(16);
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();

        let msg = CollabMessage::cursor_moved(Uuid::new_v4(), Uuid::new_v4(), Point3D::ZERO);
        let count = broadcaster.publish(&msg).unwrap();
        assert_eq!(count, 2);

        let raw1 = rx1.recv().await.unwrap();
        let raw2 = rx2.recv().await.unwrap();
        assert_eq!(*raw1, *raw2);

        let decoded = CollabMessage::decode(&raw1).unwrap();
        assert_eq!(decoded.msg_type, MessageType::CursorMoved);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broadcaster = ChannelBroadcaster::new(16);
        let msg = CollabMessage::ping(Uuid::new_v4());
        // No receivers: send reports zero, but publishing is not an error.
        assert_eq!(broadcaster.publish(&msg).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_raw_zero_copy() {
        let broadcaster = ChannelBroadcaster::new(16);
        let mut rx = broadcaster.subscribe();

        let data = Arc::new(vec![10u8, 20, 30]);
        assert_eq!(broadcaster.publish_raw(data.clone()), 1);
        assert_eq!(*rx.recv().await.unwrap(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_stats_count_published() {
        let broadcaster = ChannelBroadcaster::new(16);
        let _rx = broadcaster.subscribe();

        let msg = CollabMessage::ping(Uuid::new_v4());
        broadcaster.publish(&msg).unwrap();
        broadcaster.publish(&msg).unwrap();

        let stats = broadcaster.stats();
        assert_eq!(stats.messages_published, 2);
        assert_eq!(stats.active_receivers, 1);
    }

    #[test]
    fn test_recording_sink_captures() {
        let sink = RecordingSink::new();
        assert!(sink.is_empty());

        let msg = CollabMessage::ping(Uuid::new_v4());
        sink.publish(&msg).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.messages()[0].msg_type, MessageType::Ping);
    }
}
