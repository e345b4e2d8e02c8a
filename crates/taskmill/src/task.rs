//! Task handles and per-task policy options.

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::error::{Failure, QueueError, Result};
use crate::message::Message;

/// Admission rate parsed from `"N/s"`, `"N/m"` or `"N/h"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    per_second: f64,
}

impl Rate {
    pub fn per_second(&self) -> f64 {
        self.per_second
    }

    /// Minimum interval between admissions.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.per_second)
    }
}

impl FromStr for Rate {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        let (count, unit) = s
            .split_once('/')
            .ok_or_else(|| QueueError::InvalidRate(s.to_string()))?;
        let count: f64 = count
            .trim()
            .parse()
            .map_err(|_| QueueError::InvalidRate(s.to_string()))?;
        if count <= 0.0 || !count.is_finite() {
            return Err(QueueError::InvalidRate(s.to_string()));
        }
        let per_second = match unit.trim() {
            "s" => count,
            "m" => count / 60.0,
            "h" => count / 3600.0,
            _ => return Err(QueueError::InvalidRate(s.to_string())),
        };
        Ok(Rate { per_second })
    }
}

/// Per-task policy options, enforced by the built-in middlewares. All are
/// off by default.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Charged attempts before the message is dropped.
    pub max_tries: Option<u32>,
    /// Oldest a message may be at execution entry.
    pub max_age: Option<Duration>,
    /// Admission rate for this task within one worker.
    pub max_rate: Option<Rate>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Parse and set a rate such as `"2/s"`, `"30/m"` or `"100/h"`.
    pub fn with_max_rate(mut self, max_rate: &str) -> Result<Self> {
        self.max_rate = Some(max_rate.parse()?);
        Ok(self)
    }
}

pub(crate) type TaskFn = Arc<
    dyn Fn(Vec<Value>, Map<String, Value>) -> BoxFuture<'static, std::result::Result<(), Failure>>
        + Send
        + Sync,
>;

/// A named binding of an async callable to a queue. Obtained from
/// [`Worker::register`](crate::Worker::register); the callable itself is
/// only ever invoked by the worker, never by `send`.
pub struct Task {
    name: String,
    options: TaskOptions,
    handler: TaskFn,
    broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl Task {
    pub(crate) fn new<F, Fut>(
        name: String,
        handler: F,
        options: TaskOptions,
        broker: Arc<dyn Broker>,
    ) -> Self
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Failure>> + Send + 'static,
    {
        Self {
            name,
            options,
            handler: Arc::new(move |args, kwargs| Box::pin(handler(args, kwargs))),
            broker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Build an envelope for this task without publishing it.
    pub fn message(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Message {
        Message::new(self.name.clone(), args, kwargs)
    }

    /// Publish one invocation; returns the message id.
    pub async fn send(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<String> {
        let message = self.message(args, kwargs);
        self.broker.publish(&message, Duration::ZERO).await?;
        Ok(message.id)
    }

    /// Publish a prepared batch in one submission; returns the message ids.
    pub async fn send_bulk(&self, messages: Vec<Message>) -> Result<Vec<String>> {
        self.broker.publish_bulk(&messages).await?;
        Ok(messages.into_iter().map(|m| m.id).collect())
    }

    /// Invoke the bound callable with the message payload.
    pub(crate) async fn call(&self, message: &Message) -> std::result::Result<(), Failure> {
        (self.handler)(message.args.clone(), message.kwargs.clone()).await
    }
}
