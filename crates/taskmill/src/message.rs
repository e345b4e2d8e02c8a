//! Message envelope exchanged through the broker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{QueueError, Result};

/// Wall-clock seconds since the Unix epoch, fractional.
pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Per-message metadata updated across delivery attempts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageCtx {
    /// Wall-clock seconds at first enqueue. Written once.
    pub created_at: f64,
    /// Attempts charged against `max_tries`.
    #[serde(default)]
    pub tries: u32,
    /// Set while a rate-limit retry is in flight so the attempt is not
    /// charged against `tries`. Consumed by the retry accounting.
    #[serde(default)]
    pub rate_limited: bool,
}

/// Envelope describing a single invocation of a task.
///
/// Serializes to a JSON object with exactly the keys `task_name`, `id`,
/// `args`, `kwargs` and `ctx`; the broker stores that string as the
/// sorted-set member, scored by earliest-visible time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routes the message to a queue and selects a handler.
    pub task_name: String,
    /// Globally unique, stable across re-queueing on retry.
    pub id: String,
    /// Positional payload.
    pub args: Vec<Value>,
    /// Named payload.
    pub kwargs: Map<String, Value>,
    /// Per-attempt context.
    pub ctx: MessageCtx,
}

impl Message {
    /// Create an envelope with a fresh id and `created_at = now`.
    pub fn new(task_name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            task_name: task_name.into(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            args,
            kwargs,
            ctx: MessageCtx {
                created_at: unix_now(),
                ..Default::default()
            },
        }
    }

    /// Fresh copy of this envelope for re-injection: new id, new
    /// `created_at`, attempt bookkeeping reset. The scheduler publishes one
    /// of these per firing instead of reusing the template.
    pub fn reissue(&self) -> Self {
        Self::new(self.task_name.clone(), self.args.clone(), self.kwargs.clone())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| QueueError::Deserialization(e.to_string()))
    }
}
