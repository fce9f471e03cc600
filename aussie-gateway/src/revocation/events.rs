//! Cross-instance revocation events
//!
//! Every revocation is published so other instances can update their
//! bloom filters and drop stale cache verdicts without waiting for the
//! periodic rebuild. The in-process bus serves single-instance mode;
//! the Redis bus rides pub/sub for fleets.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

/// A revocation propagated between instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevocationEvent {
    /// A single token was revoked
    Token {
        jti: String,
        expires_at: DateTime<Utc>,
    },

    /// Every token of a user issued before a cutoff was revoked
    User {
        user_id: String,
        issued_before: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
}

/// Publish/subscribe port for revocation events
#[async_trait]
pub trait RevocationEventBus: Send + Sync {
    /// Publish an event to every other instance
    async fn publish(&self, event: RevocationEvent) -> Result<()>;

    /// Subscribe to events from other instances
    async fn subscribe(&self) -> Result<BoxStream<'static, RevocationEvent>>;
}

/// In-process event bus for single-instance deployments and tests
pub struct InProcessEventBus {
    sender: broadcast::Sender<RevocationEvent>,
}

impl InProcessEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RevocationEventBus for InProcessEventBus {
    async fn publish(&self, event: RevocationEvent) -> Result<()> {
        // A send error only means nobody is subscribed yet
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, RevocationEvent>> {
        let receiver = self.sender.subscribe();
        Ok(stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("revocation event subscriber lagged by {}", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

#[cfg(feature = "redis")]
pub use redis_impl::RedisEventBus;

#[cfg(feature = "redis")]
mod redis_impl {
    use super::*;
    use deadpool_redis::Pool as RedisPool;

    use crate::error::Error;

    const CHANNEL: &str = "aussie:revocations";

    /// Redis pub/sub event bus
    ///
    /// Publishing rides the shared pool; each subscriber holds its own
    /// dedicated pub/sub connection.
    pub struct RedisEventBus {
        pool: RedisPool,
        client: redis::Client,
    }

    impl RedisEventBus {
        pub fn new(pool: RedisPool, url: &str) -> Result<Self> {
            let client = redis::Client::open(url)?;
            Ok(Self { pool, client })
        }
    }

    #[async_trait]
    impl RevocationEventBus for RedisEventBus {
        async fn publish(&self, event: RevocationEvent) -> Result<()> {
            let payload = serde_json::to_string(&event)
                .map_err(|e| Error::Internal(format!("failed to encode revocation event: {}", e)))?;
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| Error::RedisPool(e.to_string()))?;
            redis::cmd("PUBLISH")
                .arg(CHANNEL)
                .arg(payload)
                .query_async::<()>(&mut conn)
                .await?;
            Ok(())
        }

        async fn subscribe(&self) -> Result<BoxStream<'static, RevocationEvent>> {
            let mut pubsub = self.client.get_async_pubsub().await?;
            pubsub.subscribe(CHANNEL).await?;
            Ok(pubsub
                .into_on_message()
                .filter_map(|message| async move {
                    let payload: String = message.get_payload().ok()?;
                    match serde_json::from_str(&payload) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            tracing::warn!("discarding malformed revocation event: {}", e);
                            None
                        }
                    }
                })
                .boxed())
        }
    }
}
