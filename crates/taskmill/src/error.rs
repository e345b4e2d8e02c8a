//! Error types and execution-failure signals.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors surfaced by brokers, workers and the scheduler.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unknown broker scheme: {0}")]
    UnknownScheme(String),

    #[error("Invalid rate: {0}")]
    InvalidRate(String),

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// Failure signals flowing out of the middleware chain.
///
/// `Reject` and `Retry` are contracts between middleware (or user code) and
/// the worker, never errors in themselves: the worker translates them into
/// a dropping nack and a delayed re-enqueue respectively. Everything else
/// is a crash and is dropped.
#[derive(Debug, Error)]
pub enum Failure {
    #[error("rejected: {0}")]
    Reject(String),

    #[error("retry in {delay:?}: {reason}")]
    Retry { delay: Duration, reason: String },

    #[error(transparent)]
    Error(#[from] anyhow::Error),
}

impl Failure {
    /// Signal that the message must be dropped.
    pub fn reject(reason: impl Into<String>) -> Self {
        Failure::Reject(reason.into())
    }

    /// Signal that the message must be re-enqueued after `delay`.
    pub fn retry(delay: Duration) -> Self {
        Failure::Retry {
            delay,
            reason: String::new(),
        }
    }

    /// Like [`Failure::retry`], with a reason for the logs.
    pub fn retry_with(delay: Duration, reason: impl Into<String>) -> Self {
        Failure::Retry {
            delay,
            reason: reason.into(),
        }
    }
}
