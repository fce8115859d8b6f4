// Change notifications pushed to subscribers after successful commits.
//
// Delivery is fire-and-forget: a publisher never fails the operation that
// produced the notification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Value);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub payload: Value,
}

/// Fans notifications out to every live subscriber; slow subscribers lag
/// and drop the oldest entries.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, topic: &str, payload: Value) {
        let notification = Notification { topic: topic.to_string(), payload };
        // No receivers is not an error.
        if self.tx.send(notification).is_err() {
            tracing::trace!(topic, "notification dropped: no subscribers");
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, _topic: &str, _payload: Value) {}
}
