//! Cron-driven periodic enqueue.

use chrono::{DateTime, Local, TimeDelta};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::Broker;
use crate::error::{QueueError, Result};
use crate::message::Message;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One periodic feed: a template re-published on a cron cadence.
struct ScheduledJob {
    schedule: Schedule,
    expr: String,
    template: Message,
    next_fire: DateTime<Local>,
}

impl ScheduledJob {
    /// Advance past `now`. Firings missed while the process was paused
    /// coalesce: the next fire time is computed from now, not from the
    /// previous fire time, so there is no catch-up burst.
    fn advance(&mut self, now: DateTime<Local>) {
        if let Some(next) = self.schedule.after(&now).next() {
            self.next_fire = next;
        }
    }
}

/// Publishes a fresh copy of each registered template whenever its cron
/// expression matches, evaluated against local wall-clock.
pub struct Scheduler {
    broker: Arc<dyn Broker>,
    poll_interval: Duration,
    jobs: Vec<ScheduledJob>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jobs: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Register a five-field cron feed (`minute hour day-of-month month
    /// day-of-week`, with range and step syntax).
    pub fn cron(&mut self, expr: &str, template: Message) -> Result<()> {
        // the cron crate wants a seconds field; pin it to zero
        let extended = format!("0 {}", expr.trim());
        let schedule = Schedule::from_str(&extended)
            .map_err(|e| QueueError::InvalidCron(format!("{}: {}", expr, e)))?;
        let now = Local::now();
        let next_fire = schedule
            .after(&now)
            .next()
            .ok_or_else(|| QueueError::InvalidCron(format!("{}: no upcoming fire time", expr)))?;
        self.jobs.push(ScheduledJob {
            schedule,
            expr: expr.to_string(),
            template,
            next_fire,
        });
        Ok(())
    }

    /// Stop the run loop; observed at the next tick boundary.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Publish every due job once. A failed publish is logged and keeps its
    /// fire time so the next tick retries it; it never blocks the others.
    async fn tick(&mut self, now: DateTime<Local>) {
        for job in &mut self.jobs {
            if job.next_fire > now {
                continue;
            }
            let message = job.template.reissue();
            match self.broker.publish(&message, Duration::ZERO).await {
                Ok(()) => {
                    info!(
                        task = %message.task_name,
                        expr = %job.expr,
                        id = %message.id,
                        "enqueued scheduled message"
                    );
                    job.advance(now);
                }
                Err(e) => {
                    error!(
                        task = %job.template.task_name,
                        expr = %job.expr,
                        error = %e,
                        "failed to enqueue scheduled message"
                    );
                }
            }
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            jobs = self.jobs.len(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "starting scheduler"
        );
        for job in &self.jobs {
            info!(
                task = %job.template.task_name,
                expr = %job.expr,
                next = %job.next_fire.format("%H:%M:%S"),
                "scheduled"
            );
        }

        let shutdown = self.shutdown.clone();
        let poll_interval = self.poll_interval;
        // ticks and cron evaluation share one time source: wall clock at
        // start plus the runtime clock's elapsed time
        let started_wall = Local::now();
        let started = tokio::time::Instant::now();
        loop {
            let now = started_wall + TimeDelta::from_std(started.elapsed()).unwrap_or_default();
            self.tick(now).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use async_trait::async_trait;
    use chrono::Timelike;
    use serde_json::Map;

    fn template(task_name: &str) -> Message {
        Message::new(task_name, vec![], Map::new())
    }

    /// Step the paused clock forward one second at a time so every poll
    /// tick in between actually runs.
    async fn advance_by(total: Duration) {
        let step = Duration::from_secs(1);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            let chunk = remaining.min(step);
            tokio::time::advance(chunk).await;
            remaining -= chunk;
        }
    }

    #[tokio::test]
    async fn five_field_expressions_are_accepted() {
        let mut scheduler = Scheduler::new(Arc::new(MemoryBroker::new()));
        scheduler.cron("* * * * *", template("ping")).unwrap();
        scheduler.cron("0-58/2 */3 1 * *", template("ping")).unwrap();
        assert!(scheduler.cron("not a cron", template("ping")).is_err());
        assert!(scheduler.cron("* * * *", template("ping")).is_err());
    }

    #[tokio::test]
    async fn next_fire_lands_on_a_whole_minute() {
        let mut scheduler = Scheduler::new(Arc::new(MemoryBroker::new()));
        scheduler.cron("* * * * *", template("ping")).unwrap();
        let next = scheduler.jobs[0].next_fire;
        assert_eq!(next.second(), 0);
        assert!(next > Local::now());
    }

    #[tokio::test]
    async fn due_jobs_publish_fresh_copies_and_advance() {
        let broker = Arc::new(MemoryBroker::new());
        let mut scheduler = Scheduler::new(broker.clone());
        scheduler.cron("* * * * *", template("ping")).unwrap();
        let template_id = scheduler.jobs[0].template.id.clone();

        let now = Local::now();
        scheduler.jobs[0].next_fire = now - TimeDelta::seconds(90);
        scheduler.tick(now).await;

        assert_eq!(broker.len("ping").await.unwrap(), 1);
        let published = broker.consume("ping").await.unwrap();
        assert_ne!(published.id, template_id);

        // one firing per tick, even after a long pause
        assert!(scheduler.jobs[0].next_fire > now);
    }

    #[tokio::test]
    async fn jobs_not_yet_due_are_skipped() {
        let broker = Arc::new(MemoryBroker::new());
        let mut scheduler = Scheduler::new(broker.clone());
        scheduler.cron("* * * * *", template("ping")).unwrap();

        scheduler.tick(Local::now()).await;
        assert_eq!(broker.len("ping").await.unwrap(), 0);
    }

    struct FlakyBroker {
        inner: MemoryBroker,
        failing_task: String,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn publish(&self, message: &Message, delay: Duration) -> Result<()> {
            if message.task_name == self.failing_task {
                return Err(QueueError::Broker("connection reset".to_string()));
            }
            self.inner.publish(message, delay).await
        }

        async fn consume(&self, queue: &str) -> Result<Message> {
            self.inner.consume(queue).await
        }

        async fn ack(&self, message: &Message) -> Result<()> {
            self.inner.ack(message).await
        }

        async fn nack(&self, message: &Message, delay: Duration, drop: bool) -> Result<()> {
            self.inner.nack(message, delay, drop).await
        }

        async fn len(&self, queue: &str) -> Result<usize> {
            self.inner.len(queue).await
        }

        async fn clear(&self, queue: &str) -> Result<()> {
            self.inner.clear(queue).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_exactly_twice_over_two_and_a_half_minutes() {
        let broker = Arc::new(MemoryBroker::new());
        let mut scheduler =
            Scheduler::new(broker.clone()).with_poll_interval(Duration::from_secs(1));
        scheduler.cron("* * * * *", template("ping")).unwrap();

        let first_boundary = scheduler.jobs[0].next_fire;
        let stop = scheduler.shutdown_token();
        let runner = tokio::spawn(async move { scheduler.run().await });
        // let run() capture its clock origin and register its first sleep
        tokio::task::yield_now().await;

        // align to thirty seconds before a whole minute, so firings land
        // 30s and 90s into the observation window
        let until_boundary = (first_boundary - Local::now()).to_std().unwrap_or_default();
        let align = if until_boundary >= Duration::from_secs(30) {
            until_boundary - Duration::from_secs(30)
        } else {
            until_boundary + Duration::from_secs(30)
        };
        advance_by(align).await;
        let baseline = broker.len("ping").await.unwrap();

        // two and a half minutes, stopping short of the third boundary
        advance_by(Duration::from_secs(140)).await;
        assert_eq!(broker.len("ping").await.unwrap() - baseline, 2);

        stop.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn publish_failure_is_isolated_and_retried_next_tick() {
        let broker = Arc::new(FlakyBroker {
            inner: MemoryBroker::new(),
            failing_task: "down".to_string(),
        });
        let mut scheduler = Scheduler::new(broker.clone());
        scheduler.cron("* * * * *", template("down")).unwrap();
        scheduler.cron("* * * * *", template("up")).unwrap();

        let now = Local::now();
        let due = now - TimeDelta::seconds(5);
        scheduler.jobs[0].next_fire = due;
        scheduler.jobs[1].next_fire = due;
        scheduler.tick(now).await;

        // the healthy job published and advanced
        assert_eq!(broker.len("up").await.unwrap(), 1);
        assert!(scheduler.jobs[1].next_fire > now);

        // the failed job kept its fire time for the next tick
        assert_eq!(broker.len("down").await.unwrap(), 0);
        assert_eq!(scheduler.jobs[0].next_fire, due);
    }
}
