//! Scoped middleware around task execution.
//!
//! A middleware observes a message entering execution and observes the
//! outcome on the way out; the chain is composed in registration order
//! around the task's callable, so the first middleware runs outermost.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

use crate::error::Failure;
use crate::message::{unix_now, Message};
use crate::task::{Task, TaskOptions};

/// The remainder of the chain, ending at the task's callable.
pub struct Next<'a> {
    pub(crate) chain: &'a [Arc<dyn Middleware>],
    pub(crate) task: &'a Task,
}

impl Next<'_> {
    /// Enter the next scope, or the callable once the chain is exhausted.
    pub async fn run(self, message: &mut Message) -> std::result::Result<(), Failure> {
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    chain: rest,
                    task: self.task,
                };
                middleware.handle(self.task.options(), message, next).await
            }
            None => self.task.call(message).await,
        }
    }
}

/// A scoped wrapper around execution. Implementations may inspect or
/// mutate `message.ctx`, short-circuit with [`Failure::Reject`], reschedule
/// with [`Failure::Retry`], or pass the outcome through.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(
        &self,
        options: &TaskOptions,
        message: &mut Message,
        next: Next<'_>,
    ) -> std::result::Result<(), Failure>;
}

/// The default policy chain, in order: tries bound, age bound, rate bound.
pub fn default_middlewares() -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(MaxTries::new()),
        Arc::new(MaxAge),
        Arc::new(MaxRate::new()),
    ]
}

pub(crate) async fn run_chain(
    chain: &[Arc<dyn Middleware>],
    task: &Task,
    message: &mut Message,
) -> std::result::Result<(), Failure> {
    Next { chain, task }.run(message).await
}

/// Sub-second clock noise as a `0..1` factor; enough to spread retry bursts.
fn jitter() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Bounds charged delivery attempts.
///
/// A message that has already been charged `max_tries` attempts is rejected
/// on entry. A crash on the way out charges one attempt and, while attempts
/// remain, is converted into a delayed [`Failure::Retry`] with exponential
/// backoff; at the bound the crash propagates and the worker drops the
/// message. Explicit retries are not charged (they are retry-driven, not
/// failure-driven), and neither are rate-limit retries, recognized by the
/// `rate_limited` ctx flag, which this middleware consumes on every exit.
pub struct MaxTries {
    min_delay: Duration,
    max_delay: Duration,
    backoff: f64,
}

impl MaxTries {
    pub fn new() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff: 2.0,
        }
    }

    /// Override the retry backoff curve.
    pub fn with_delays(min_delay: Duration, max_delay: Duration, backoff: f64) -> Self {
        Self {
            min_delay,
            max_delay,
            backoff,
        }
    }

    fn delay_for(&self, tries: u32) -> Duration {
        let base = self.min_delay.as_secs_f64()
            * self.backoff.powi(tries.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        // up to 25% jitter
        Duration::from_secs_f64(capped * (1.0 + jitter() * 0.25))
    }
}

impl Default for MaxTries {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for MaxTries {
    async fn handle(
        &self,
        options: &TaskOptions,
        message: &mut Message,
        next: Next<'_>,
    ) -> std::result::Result<(), Failure> {
        let Some(max_tries) = options.max_tries else {
            return next.run(message).await;
        };

        if message.ctx.tries >= max_tries {
            return Err(Failure::reject(format!(
                "exhausted {} of {} tries",
                message.ctx.tries, max_tries
            )));
        }

        let result = next.run(message).await;
        let rate_limited = std::mem::take(&mut message.ctx.rate_limited);

        match result {
            Err(Failure::Error(error)) if !rate_limited => {
                message.ctx.tries += 1;
                if message.ctx.tries >= max_tries {
                    return Err(Failure::Error(error));
                }
                let delay = self.delay_for(message.ctx.tries);
                warn!(
                    task = %message.task_name,
                    id = %message.id,
                    tries = message.ctx.tries,
                    max_tries,
                    error = %error,
                    "attempt failed, retrying"
                );
                Err(Failure::Retry {
                    delay,
                    reason: error.to_string(),
                })
            }
            other => other,
        }
    }
}

/// Rejects messages older than the task's `max_age` before execution.
pub struct MaxAge;

#[async_trait]
impl Middleware for MaxAge {
    async fn handle(
        &self,
        options: &TaskOptions,
        message: &mut Message,
        next: Next<'_>,
    ) -> std::result::Result<(), Failure> {
        if let Some(max_age) = options.max_age {
            let age = unix_now() - message.ctx.created_at;
            if age > max_age.as_secs_f64() {
                return Err(Failure::reject(format!(
                    "message is {:.1}s old, max_age is {:?}",
                    age, max_age
                )));
            }
        }
        next.run(message).await
    }
}

/// Enforces a per-task minimum interval between admissions.
///
/// Deferred deliveries come back as a jittered [`Failure::Retry`] with the
/// `rate_limited` ctx flag set, so the attempt is not charged against
/// `max_tries`. The `last_admit` table is per middleware instance and
/// therefore worker-local; a deliberately shared instance is still safe.
pub struct MaxRate {
    last_admit: DashMap<String, Instant>,
}

impl MaxRate {
    pub fn new() -> Self {
        Self {
            last_admit: DashMap::new(),
        }
    }
}

impl Default for MaxRate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for MaxRate {
    async fn handle(
        &self,
        options: &TaskOptions,
        message: &mut Message,
        next: Next<'_>,
    ) -> std::result::Result<(), Failure> {
        if let Some(rate) = options.max_rate {
            let interval = rate.interval();
            let now = Instant::now();
            // the entry API keeps check-and-stamp atomic under sharing
            let deferred = match self.last_admit.entry(message.task_name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(now);
                    None
                }
                Entry::Occupied(mut slot) => {
                    let elapsed = now.duration_since(*slot.get());
                    if elapsed < interval {
                        Some(interval - elapsed)
                    } else {
                        slot.insert(now);
                        None
                    }
                }
            };

            if let Some(base) = deferred {
                message.ctx.rate_limited = true;
                // half the remaining interval plus jitter, to spread bursts
                let delay = base.mul_f64(0.5 + jitter() * 0.5);
                return Err(Failure::retry_with(delay, "rate limited"));
            }
        }
        next.run(message).await
    }
}

/// Hook receiving failures that escaped execution.
#[async_trait]
pub trait Reporter: Send + Sync + 'static {
    async fn report(&self, message: &Message, failure: &Failure);
}

/// Forwards escaped failures to a [`Reporter`] and re-raises them. Retry
/// signals pass through unreported; rejects and crashes are surfaced.
pub struct Reporting {
    reporter: Arc<dyn Reporter>,
}

impl Reporting {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl Middleware for Reporting {
    async fn handle(
        &self,
        _options: &TaskOptions,
        message: &mut Message,
        next: Next<'_>,
    ) -> std::result::Result<(), Failure> {
        match next.run(message).await {
            Err(failure) => {
                if !matches!(failure, Failure::Retry { .. }) {
                    self.reporter.report(message, &failure).await;
                }
                Err(failure)
            }
            ok => ok,
        }
    }
}
