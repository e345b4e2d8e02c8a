//! taskmill: distributed background-task queue.
//!
//! Producers bind async callables to named tasks and enqueue invocation
//! messages through a broker (Redis sorted sets, or in-process for tests
//! and embedded runs). Worker processes poll per-task queues, execute
//! claimed messages under a concurrency bound inside a composable
//! middleware chain, and ack or nack by outcome. A cron scheduler
//! re-injects periodic messages. Delivery is at-least-once.
//!
//! ```rust,no_run
//! # async fn example() -> taskmill::Result<()> {
//! let broker = taskmill::broker_from_url("redis://localhost:6379").await?;
//!
//! let mut worker = taskmill::Worker::new("mail", broker);
//! let send_welcome = worker.register(
//!     "send_welcome",
//!     |args, _kwargs| async move {
//!         println!("welcome, {:?}", args);
//!         Ok(())
//!     },
//!     taskmill::TaskOptions::new().with_max_tries(5),
//! )?;
//!
//! send_welcome
//!     .send(vec![serde_json::json!("ada")], Default::default())
//!     .await?;
//! worker.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod broker;
pub mod error;
pub mod message;
pub mod middleware;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use app::App;
pub use broker::{
    broker_from_url, Broker, MemoryBroker, RedisBroker, RedisBrokerConfig, DEFAULT_BROKER_URL,
};
pub use error::{Failure, QueueError, Result};
pub use message::{Message, MessageCtx};
pub use middleware::{
    default_middlewares, MaxAge, MaxRate, MaxTries, Middleware, Next, Reporter, Reporting,
};
pub use scheduler::Scheduler;
pub use task::{Rate, Task, TaskOptions};
pub use worker::Worker;
