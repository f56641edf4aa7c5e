//! Redis-backed fanout bus. `PUBLISH` carries events across gateway
//! processes; a pattern subscription feeds them back into the in-process
//! [`LocalBus`], which does the local per-connection fanout. Local delivery
//! therefore always goes through Redis, so a single instance and a fleet
//! behave identically: every interested process, including the publishing
//! one, sees the event in channel order.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use fanout_bus::{Bus, BusError, BusMessage, BusResult, LocalBus};

const CHANNEL_PREFIX: &str = "verso:";

pub struct RedisBus {
    local: Arc<LocalBus>,
    conn: ConnectionManager,
}

impl RedisBus {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{}*", CHANNEL_PREFIX)).await?;

        let local = Arc::new(LocalBus::new());
        let listener_local = local.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let channel = message.get_channel_name().to_string();
                let Some(topic) = channel.strip_prefix(CHANNEL_PREFIX) else {
                    continue;
                };
                let payload = Bytes::copy_from_slice(message.get_payload_bytes());
                match listener_local.publish(topic, payload).await {
                    Ok(reached) => {
                        debug!(topic = %topic, reached, "redis event relayed locally");
                    }
                    Err(err) => {
                        warn!(topic = %topic, error = %err, "local relay failed");
                    }
                }
            }
            warn!("redis pubsub stream ended; cross-process fanout stopped");
        });

        Ok(Self { local, conn })
    }
}

#[async_trait::async_trait]
impl Bus for RedisBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.local.subscribe(topic)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let mut conn = self.conn.clone();
        let channel = format!("{}{}", CHANNEL_PREFIX, topic);
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload.as_ref())
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(receivers as usize)
    }
}
