use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Per-topic channel capacity. A slow fanout consumer past this depth starts
/// lagging and is told so via `RecvError::Lagged`; delivery is at-least-once,
/// never exactly-once, so consumers must tolerate both gaps and duplicates.
pub const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Shared publish/subscribe bus carrying engagement events between the
/// processes that handle writes and the processes holding push connections.
#[async_trait::async_trait]
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;

    /// Publish to a topic. Returns the number of subscribers reached in this
    /// process, which is zero when nobody here is interested.
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;
}

/// In-memory bus for tests and single-process deployments. Events published
/// on a topic reach every current subscriber of that topic in publish order,
/// including the publishing session's own connection.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait::async_trait]
impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let sender = self.sender_for(topic);
        // A topic with no live subscribers is not an error: the write still
        // happened, there was just nobody to notify in this process.
        Ok(sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("thread:t1");
        let reached = bus
            .publish("thread:t1", Bytes::from_static(b"{}"))
            .await
            .expect("publish ok");
        assert_eq!(reached, 1);
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "thread:t1");
        assert_eq!(msg.payload, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_reaches_nobody() {
        let bus = LocalBus::new();
        let reached = bus
            .publish("thread:empty", Bytes::from_static(b"{}"))
            .await
            .expect("publish ok");
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn per_topic_order_is_preserved() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("thread:t1");
        for i in 0..4u8 {
            bus.publish("thread:t1", Bytes::copy_from_slice(&[i]))
                .await
                .expect("publish ok");
        }
        for i in 0..4u8 {
            let msg = sub.recv().await.expect("receive ok");
            assert_eq!(msg.payload.as_ref(), &[i]);
        }
    }
}
