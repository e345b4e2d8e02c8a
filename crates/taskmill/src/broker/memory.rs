//! In-process broker for tests and embedded runs.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

use super::Broker;
use crate::error::Result;
use crate::message::{unix_now, Message};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Broker keeping every queue in process memory.
///
/// Ready entries are `(serialized message, visibility score)` pairs. There
/// is no processing set: a claim removes the entry outright, `ack` is a
/// no-op and a dropping `nack` simply suppresses the re-publish.
#[derive(Default)]
pub struct MemoryBroker {
    queues: DashMap<String, Vec<(String, f64)>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the earliest visible entry, insertion order
    /// breaking score ties so undelayed publishes stay FIFO.
    fn claim(&self, queue: &str) -> Result<Option<Message>> {
        let Some(mut entries) = self.queues.get_mut(queue) else {
            return Ok(None);
        };
        let now = unix_now();
        let mut earliest: Option<(usize, f64)> = None;
        for (idx, (_, score)) in entries.iter().enumerate() {
            if *score <= now && earliest.map_or(true, |(_, best)| *score < best) {
                earliest = Some((idx, *score));
            }
        }
        match earliest {
            Some((idx, _)) => {
                let (raw, _) = entries.remove(idx);
                drop(entries);
                Ok(Some(Message::from_json(&raw)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: &Message, delay: Duration) -> Result<()> {
        let raw = message.to_json()?;
        let score = unix_now() + delay.as_secs_f64();
        self.queues
            .entry(message.task_name.clone())
            .or_default()
            .push((raw, score));
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Message> {
        loop {
            if let Some(message) = self.claim(queue)? {
                return Ok(message);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, message: &Message, delay: Duration, drop: bool) -> Result<()> {
        if !drop {
            self.publish(message, delay).await?;
        }
        Ok(())
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        Ok(self.queues.get(queue).map_or(0, |entries| entries.len()))
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        self.queues.remove(queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
