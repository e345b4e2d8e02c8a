//! Broker abstraction over message storage and transport.
//!
//! A broker keeps, per task name, a ready set of `(serialized message,
//! visibility score)` pairs and a per-consumer processing set of claimed
//! messages. Consuming atomically moves the earliest visible message from
//! ready to processing; ack removes it, nack removes and optionally
//! re-publishes it with a delay.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::{QueueError, Result};
use crate::message::Message;

pub use memory::MemoryBroker;
pub use redis::{RedisBroker, RedisBrokerConfig};

/// Broker URL used when none is configured.
pub const DEFAULT_BROKER_URL: &str = "redis://localhost:6379";

impl std::fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Broker").finish()
    }
}

/// Message storage shared by producers and consumers.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Insert `message` into its ready set, visible after `delay`.
    async fn publish(&self, message: &Message, delay: Duration) -> Result<()>;

    /// Publish a batch without delay. Implementations may submit the batch
    /// in one round trip; per-message publish semantics hold either way.
    async fn publish_bulk(&self, messages: &[Message]) -> Result<()> {
        for message in messages {
            self.publish(message, Duration::ZERO).await?;
        }
        Ok(())
    }

    /// Claim the earliest visible message of `queue`, blocking on a short
    /// poll interval until one is available or the future is dropped.
    async fn consume(&self, queue: &str) -> Result<Message>;

    /// Remove a handled message from this consumer's processing set.
    async fn ack(&self, message: &Message) -> Result<()>;

    /// Remove from the processing set and, unless `drop`, re-publish with
    /// the given delay.
    async fn nack(&self, message: &Message, delay: Duration, drop: bool) -> Result<()>;

    /// Number of messages in the ready set.
    async fn len(&self, queue: &str) -> Result<usize>;

    /// Delete the queue's ready and processing keys.
    async fn clear(&self, queue: &str) -> Result<()>;

    /// Release underlying connections.
    async fn close(&self) -> Result<()>;
}

/// Construct a broker from a URL: `memory://` for the in-process variant,
/// `redis://host:port[/db]` for the durable one.
pub async fn broker_from_url(url: &str) -> Result<Arc<dyn Broker>> {
    let parsed = Url::parse(url)
        .map_err(|e| QueueError::Configuration(format!("invalid broker url {}: {}", url, e)))?;
    match parsed.scheme() {
        "memory" => Ok(Arc::new(MemoryBroker::new())),
        "redis" => {
            let config = RedisBrokerConfig {
                url: url.to_string(),
                ..Default::default()
            };
            Ok(Arc::new(RedisBroker::new(config).await?))
        }
        other => Err(QueueError::UnknownScheme(other.to_string())),
    }
}
