//! Multi-worker supervisor.

use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{QueueError, Result};
use crate::middleware::Middleware;
use crate::worker::Worker;

/// Aggregates workers and runs each on its own OS thread with its own
/// runtime, so one worker's load cannot starve another's pollers.
#[derive(Default)]
pub struct App {
    workers: Vec<Worker>,
    middlewares: Vec<Arc<dyn Middleware>>,
    shutdown: CancellationToken,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// App-wide middleware, prepended to every worker's chain at
    /// registration so it runs outermost.
    pub fn with_middlewares(mut self, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        self.middlewares = middlewares;
        self
    }

    /// Add a worker. Names are unique within an app; the worker's shutdown
    /// becomes a child of the app's, so `App::shutdown` stops everything
    /// while `Worker::shutdown` still stops just the one.
    pub fn register_worker(&mut self, mut worker: Worker) -> Result<()> {
        if self.workers.iter().any(|w| w.name() == worker.name()) {
            return Err(QueueError::DuplicateWorker(worker.name().to_string()));
        }
        worker.prepend_middlewares(&self.middlewares);
        worker.set_shutdown(self.shutdown.child_token());
        self.workers.push(worker);
        Ok(())
    }

    /// Cancel every worker; `run` returns once in-flight work drains.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every worker to completion. Blocks the calling thread and
    /// returns the first worker failure, if any.
    pub fn run(self) -> Result<()> {
        let mut handles = Vec::new();
        for worker in self.workers {
            let name = worker.name().to_string();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", name))
                .spawn(move || -> Result<()> {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(|e| {
                            QueueError::Internal(format!("failed to build runtime: {}", e))
                        })?;
                    runtime.block_on(worker.run())
                })
                .map_err(|e| QueueError::Internal(format!("failed to spawn thread: {}", e)))?;
            handles.push((name, handle));
        }

        let mut failure: Option<QueueError> = None;
        for (name, handle) in handles {
            match handle.join() {
                Ok(Ok(())) => info!(worker = %name, "worker exited"),
                Ok(Err(e)) => {
                    error!(worker = %name, error = %e, "worker failed");
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    failure.get_or_insert(QueueError::Internal(format!(
                        "worker thread {} panicked",
                        name
                    )));
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
