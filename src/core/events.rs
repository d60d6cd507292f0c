//! Single-process event bus for WebSocket broadcast.
//!
//! Topic-keyed publish/subscribe over a `tokio::sync::broadcast` channel.
//! Publish never blocks: a slow subscriber lags and drops events on its own
//! receiver (counted there), and no backpressure propagates to publishers.
//! Subscribers reconcile with a follow-up state fetch after drops.

use crate::core::time;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::debug;

pub const TOPIC_INDEXING_PROGRESS: &str = "indexing_progress";
pub const TOPIC_INDEXING_COMPLETE: &str = "indexing_complete";
pub const TOPIC_INDEXING_ERROR: &str = "indexing_error";
pub const TOPIC_FOCUS_CHANGED: &str = "focus_changed";
pub const TOPIC_DECISION_ADDED: &str = "decision_added";
pub const TOPIC_SACRED_PLAN_CREATED: &str = "sacred_plan_created";
pub const TOPIC_SACRED_PLAN_APPROVED: &str = "sacred_plan_approved";

/// All topics, in the order clients see them documented.
pub const ALL_TOPICS: &[&str] = &[
    TOPIC_INDEXING_PROGRESS,
    TOPIC_INDEXING_COMPLETE,
    TOPIC_INDEXING_ERROR,
    TOPIC_FOCUS_CHANGED,
    TOPIC_DECISION_ADDED,
    TOPIC_SACRED_PLAN_CREATED,
    TOPIC_SACRED_PLAN_APPROVED,
];

/// One event frame as delivered to WebSocket clients.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub event: String,
    pub payload: JsonValue,
    pub ts: String,
}

/// Broadcast bus handle. Cheap to clone via `subscribe`.
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    /// `capacity` bounds each subscriber's queue; beyond it the oldest
    /// events are dropped for that subscriber only.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        EventBus { tx }
    }

    /// Publish an event. Non-blocking; no receivers is not an error.
    pub fn publish(&self, topic: &str, payload: JsonValue) {
        let event = BusEvent {
            event: topic.to_string(),
            payload,
            ts: time::now_iso(),
        };
        match self.tx.send(event) {
            Ok(receivers) => debug!(topic, receivers, "published event"),
            Err(_) => debug!(topic, "published event with no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(
            TOPIC_FOCUS_CHANGED,
            serde_json::json!({"project_id": "proj_1", "project_name": "S"}),
        );
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event, TOPIC_FOCUS_CHANGED);
        assert_eq!(event.payload["project_id"], "proj_1");
        assert!(!event.ts.is_empty());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(16);
        bus.publish(TOPIC_INDEXING_PROGRESS, serde_json::json!({"progress": 10}));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking_publisher() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        for i in 0..64 {
            bus.publish(TOPIC_INDEXING_PROGRESS, serde_json::json!({ "i": i }));
        }
        // The receiver lost the oldest events and reports how many.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
