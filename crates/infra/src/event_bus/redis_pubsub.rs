//! Redis pub/sub transport for job notifications (optional).
//!
//! Each event goes to its own owner topic (`compression:<kind>:<owner>`), so
//! any Redis-speaking relay can subscribe to a single user. Pub/sub is not
//! durable; that matches the best-effort contract of the real-time channel.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use tracing::{instrument, warn};

use dirpack_events::{ChannelEvent, EventBus, Subscription, TOPIC_PREFIX};

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self { client })
    }
}

impl EventBus<ChannelEvent> for RedisPubSubEventBus {
    type Error = RedisBusError;

    #[instrument(skip(self, message), fields(topic = %message.topic()), err)]
    fn publish(&self, message: ChannelEvent) -> Result<(), Self::Error> {
        let payload =
            serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(message.topic(), payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    /// Pattern-subscribes to every job topic; callers filter by owner.
    fn subscribe(&self) -> Subscription<ChannelEvent> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();

        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "redis subscription could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.psubscribe(format!("{TOPIC_PREFIX}:*")) {
                warn!(error = %e, "redis psubscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let event: ChannelEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(_) => continue,
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
