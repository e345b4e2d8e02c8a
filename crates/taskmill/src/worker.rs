//! Worker runtime: per-task pollers with bounded concurrency.

use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broker::{broker_from_url, Broker};
use crate::error::{Failure, QueueError, Result};
use crate::message::Message;
use crate::middleware::{default_middlewares, run_chain, Middleware};
use crate::task::{Task, TaskOptions};

/// Messages of one task executing concurrently, per worker.
const DEFAULT_CONCURRENCY: usize = 250;

/// Polls one queue per registered task and executes claimed messages under
/// a per-task concurrency bound, translating outcomes into ack/nack.
pub struct Worker {
    name: String,
    broker: Arc<dyn Broker>,
    middlewares: Vec<Arc<dyn Middleware>>,
    concurrency: usize,
    tasks: Vec<Arc<Task>>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(name: impl Into<String>, broker: Arc<dyn Broker>) -> Self {
        Self {
            name: name.into(),
            broker,
            middlewares: default_middlewares(),
            concurrency: DEFAULT_CONCURRENCY,
            tasks: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Connect to a broker URL and build a worker around it.
    pub async fn connect(name: impl Into<String>, url: &str) -> Result<Self> {
        Ok(Self::new(name, broker_from_url(url).await?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Replace the default middleware chain.
    pub fn with_middlewares(mut self, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        self.middlewares = middlewares;
        self
    }

    /// Append a middleware; it runs innermost, closest to the callable.
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// App-wide policies run outermost.
    pub(crate) fn prepend_middlewares(&mut self, middlewares: &[Arc<dyn Middleware>]) {
        let mut chain = middlewares.to_vec();
        chain.append(&mut self.middlewares);
        self.middlewares = chain;
    }

    pub(crate) fn set_shutdown(&mut self, shutdown: CancellationToken) {
        self.shutdown = shutdown;
    }

    /// Bind `handler` to `name`, returning a handle that can build and send
    /// messages for it. Names are unique within a worker.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
        options: TaskOptions,
    ) -> Result<Arc<Task>>
    where
        F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Failure>> + Send + 'static,
    {
        let name = name.into();
        if self.tasks.iter().any(|t| t.name() == name) {
            return Err(QueueError::DuplicateTask(name));
        }
        let task = Arc::new(Task::new(name, handler, options, self.broker.clone()));
        self.tasks.push(task.clone());
        Ok(task)
    }

    /// Request a graceful stop: pollers stop consuming, in-flight
    /// executions are awaited, then the broker is closed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all pollers until shutdown or a broker transport failure. A
    /// consume failure cancels the remaining pollers, drains in-flight
    /// executions and surfaces the error.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker = %self.name,
            tasks = self.tasks.len(),
            concurrency = self.concurrency,
            "starting worker"
        );

        let tracker = TaskTracker::new();
        let middlewares: Arc<[Arc<dyn Middleware>]> = Arc::from(self.middlewares.clone());
        let mut pollers = JoinSet::new();
        for task in &self.tasks {
            info!(worker = %self.name, task = %task.name(), "polling task queue");
            pollers.spawn(poll_loop(
                self.broker.clone(),
                task.clone(),
                middlewares.clone(),
                self.concurrency,
                tracker.clone(),
                self.shutdown.clone(),
            ));
        }

        let mut failure: Option<QueueError> = None;
        while let Some(joined) = pollers.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(QueueError::Internal(format!("poller panicked: {}", e))),
            };
            if let Err(e) = result {
                error!(worker = %self.name, error = %e, "poller failed, shutting down");
                self.shutdown.cancel();
                failure.get_or_insert(e);
            }
        }

        // drain in-flight executions before closing the broker
        tracker.close();
        tracker.wait().await;
        self.broker.close().await?;
        info!(worker = %self.name, "worker stopped");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn poll_loop(
    broker: Arc<dyn Broker>,
    task: Arc<Task>,
    middlewares: Arc<[Arc<dyn Middleware>]>,
    concurrency: usize,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            consumed = broker.consume(task.name()) => consumed?,
        };

        // Acquired before spawning, so the loop never over-commits: when
        // all slots are busy it stops consuming and leaves ready messages
        // visible to other consumers.
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| QueueError::Internal(format!("semaphore closed: {}", e)))?;

        let broker = broker.clone();
        let task = task.clone();
        let middlewares = middlewares.clone();
        tracker.spawn(async move {
            process(broker, task, &middlewares, message).await;
            drop(permit);
        });
    }
}

/// Execute one claimed message through the middleware chain and translate
/// the outcome: success acks, a reject drops, a retry re-enqueues with its
/// delay, and a crash drops with a logged trace.
async fn process(
    broker: Arc<dyn Broker>,
    task: Arc<Task>,
    middlewares: &[Arc<dyn Middleware>],
    mut message: Message,
) {
    debug!(
        task = %task.name(),
        id = %message.id,
        tries = message.ctx.tries,
        "processing message"
    );

    let outcome = if message.task_name != task.name() {
        Err(Failure::reject(format!(
            "task name mismatch: expected {}, got {}",
            task.name(),
            message.task_name
        )))
    } else {
        run_chain(middlewares, task.as_ref(), &mut message).await
    };

    let delivered = match outcome {
        Ok(()) => broker.ack(&message).await,
        Err(Failure::Reject(reason)) => {
            warn!(task = %task.name(), id = %message.id, reason = %reason, "message rejected");
            broker.nack(&message, Duration::ZERO, true).await
        }
        Err(Failure::Retry { delay, reason }) => {
            warn!(
                task = %task.name(),
                id = %message.id,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "message will be retried"
            );
            broker.nack(&message, delay, false).await
        }
        Err(Failure::Error(error)) => {
            error!(
                task = %task.name(),
                id = %message.id,
                error = ?error,
                "message crashed, dropping"
            );
            broker.nack(&message, Duration::ZERO, true).await
        }
    };

    // A transport failure here leaves the message in the processing set;
    // an operator sweep reclaims it (see RedisBroker::requeue).
    if let Err(e) = delivered {
        error!(task = %task.name(), id = %message.id, error = %e, "broker ack/nack failed");
    }
}
