//! A scheduler feeding a worker over the in-process broker.
//!
//!   cargo run --example demo_scheduled

use serde_json::{Map, Value};
use std::sync::Arc;
use taskmill::{Scheduler, TaskOptions, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("taskmill=debug,info")
        .init();

    let broker = taskmill::broker_from_url("memory://").await?;

    let mut worker = Worker::new("beat", broker.clone()).with_concurrency(4);
    let ping = worker.register(
        "ping",
        |_args: Vec<Value>, _kwargs: Map<String, Value>| async move {
            tracing::info!("pong");
            Ok(())
        },
        TaskOptions::new(),
    )?;

    let mut scheduler = Scheduler::new(broker);
    scheduler.cron("* * * * *", ping.message(vec![], Map::new()))?;

    let worker = Arc::new(worker);
    let poller = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };
    let beat_stop = scheduler.shutdown_token();
    let beat = tokio::spawn(async move { scheduler.run().await });

    tokio::signal::ctrl_c().await?;
    beat_stop.cancel();
    worker.shutdown();

    beat.await??;
    poller.await??;
    Ok(())
}
