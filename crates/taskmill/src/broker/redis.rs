//! Durable broker backed by Redis sorted sets.
//!
//! Each task name maps to two keys: `queue:{task_name}` holds ready
//! messages scored by earliest-visible time, and
//! `processing:{task_name}:{consumer_id}` holds the messages this consumer
//! instance has claimed. Consumer ids are fresh per broker instance, so two
//! workers never touch each other's processing sets.

use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info};

use super::Broker;
use crate::error::{QueueError, Result};
use crate::message::{unix_now, Message};

/// Claims the earliest visible member of the ready set, moving it into the
/// consumer's processing set in the same script so a crash between the two
/// steps cannot leave the message in both places.
const CLAIM_SCRIPT: &str = r#"
local ready = redis.call('ZRANGEBYSCORE', KEYS[1], 0, ARGV[1], 'LIMIT', 0, 1)
if #ready == 0 then
    return false
end
local member = ready[1]
redis.call('ZADD', KEYS[2], ARGV[1], member)
redis.call('ZREM', KEYS[1], member)
return member
"#;

#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Sleep between empty polls in `consume`
    pub poll_interval: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: super::DEFAULT_BROKER_URL.to_string(),
            pool_size: 10,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Redis broker implementation.
pub struct RedisBroker {
    config: RedisBrokerConfig,
    pool: Pool,
    consumer_id: String,
    claim: redis::Script,
    /// Serialized form each in-flight message was claimed with, by id.
    /// Middleware mutates `ctx` before ack/nack, so removal from the
    /// processing set must use the claimed bytes, not a re-serialization.
    claimed: DashMap<String, String>,
}

fn queue_key(queue: &str) -> String {
    format!("queue:{}", queue)
}

impl RedisBroker {
    /// Create a broker and verify the server is reachable.
    pub async fn new(config: RedisBrokerConfig) -> Result<Self> {
        let mut consumer_id = uuid::Uuid::new_v4().simple().to_string();
        consumer_id.truncate(8);

        debug!(
            url = %config.url,
            pool_size = config.pool_size,
            consumer_id = %consumer_id,
            "connecting redis broker"
        );

        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| QueueError::Connection(format!("failed to create pool builder: {}", e)))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| QueueError::Connection(format!("failed to create pool: {}", e)))?;

        let broker = Self {
            config,
            pool,
            consumer_id,
            claim: redis::Script::new(CLAIM_SCRIPT),
            claimed: DashMap::new(),
        };

        // Fail fast on an unreachable server instead of inside a poll loop.
        let mut conn = broker.conn().await?;
        let _: Option<String> = conn.get("__ping__").await.ok();

        Ok(broker)
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("processing:{}:{}", queue, self.consumer_id)
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(format!("failed to get connection: {}", e)))
    }

    /// Move processing entries claimed more than `older_than` ago, for any
    /// consumer of `queue`, back into the ready set. Returns how many were
    /// moved. This is an operator sweep for crashed consumers; it is never
    /// run implicitly because the broker cannot tell a dead consumer from a
    /// slow handler.
    pub async fn requeue(&self, queue: &str, older_than: Duration) -> Result<usize> {
        let cutoff = unix_now() - older_than.as_secs_f64();
        let pattern = format!("processing:{}:*", queue);
        let mut conn = self.conn().await?;

        let keys: Vec<String> = conn
            .keys(&pattern)
            .await
            .map_err(|e| QueueError::Broker(format!("keys {} failed: {}", pattern, e)))?;

        let mut moved = 0;
        for key in keys {
            let stale: Vec<String> = conn
                .zrangebyscore(&key, 0f64, cutoff)
                .await
                .map_err(|e| QueueError::Broker(format!("zrangebyscore failed: {}", e)))?;
            for raw in stale {
                redis::pipe()
                    .zadd(queue_key(queue), &raw, unix_now())
                    .zrem(&key, &raw)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| QueueError::Broker(format!("requeue failed: {}", e)))?;
                moved += 1;
            }
        }
        if moved > 0 {
            info!(queue = %queue, moved, "requeued stale processing entries");
        }
        Ok(moved)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, message: &Message, delay: Duration) -> Result<()> {
        let raw = message.to_json()?;
        let score = unix_now() + delay.as_secs_f64();
        let mut conn = self.conn().await?;
        conn.zadd::<_, _, _, ()>(queue_key(&message.task_name), raw, score)
            .await
            .map_err(|e| QueueError::Broker(format!("zadd failed: {}", e)))?;
        Ok(())
    }

    async fn publish_bulk(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let score = unix_now();
        let mut pipe = redis::pipe();
        for message in messages {
            pipe.zadd(queue_key(&message.task_name), message.to_json()?, score);
        }
        let mut conn = self.conn().await?;
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::Broker(format!("bulk zadd failed: {}", e)))?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Message> {
        loop {
            let now = unix_now();
            let mut conn = self.conn().await?;
            let raw: Option<String> = self
                .claim
                .key(queue_key(queue))
                .key(self.processing_key(queue))
                .arg(now)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| QueueError::Broker(format!("claim script failed: {}", e)))?;
            drop(conn);

            if let Some(raw) = raw {
                let message = Message::from_json(&raw)?;
                self.claimed.insert(message.id.clone(), raw);
                return Ok(message);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        let raw = match self.claimed.remove(&message.id) {
            Some((_, raw)) => raw,
            None => message.to_json()?,
        };
        let mut conn = self.conn().await?;
        conn.zrem::<_, _, ()>(self.processing_key(&message.task_name), raw)
            .await
            .map_err(|e| QueueError::Broker(format!("zrem failed: {}", e)))?;
        Ok(())
    }

    async fn nack(&self, message: &Message, delay: Duration, drop: bool) -> Result<()> {
        let raw = match self.claimed.remove(&message.id) {
            Some((_, raw)) => raw,
            None => message.to_json()?,
        };
        let mut conn = self.conn().await?;
        conn.zrem::<_, _, ()>(self.processing_key(&message.task_name), raw)
            .await
            .map_err(|e| QueueError::Broker(format!("zrem failed: {}", e)))?;
        std::mem::drop(conn);

        if !drop {
            self.publish(message, delay).await?;
        }
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        conn.zcard(queue_key(queue))
            .await
            .map_err(|e| QueueError::Broker(format!("zcard failed: {}", e)))
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(vec![queue_key(queue), self.processing_key(queue)])
            .await
            .map_err(|e| QueueError::Broker(format!("del failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }
}
