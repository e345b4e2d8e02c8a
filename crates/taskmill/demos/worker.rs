//! A worker with a rate-limited, retry-bounded task.
//!
//! Run Redis locally, then:
//!   cargo run --example demo_worker

use serde_json::{json, Map, Value};
use std::time::Duration;
use taskmill::{TaskOptions, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("taskmill=debug,info")
        .init();

    let broker = taskmill::broker_from_url("redis://localhost:6379").await?;
    let mut worker = Worker::new("demo", broker).with_concurrency(16);

    let fetch_repo = worker.register(
        "fetch_repo",
        |args: Vec<Value>, _kwargs: Map<String, Value>| async move {
            let repo = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            tracing::info!(repo = %repo, "fetching repository metadata");
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        },
        TaskOptions::new()
            .with_max_tries(3)
            .with_max_age(Duration::from_secs(3600))
            .with_max_rate("5/s")?,
    )?;

    for repo in ["rust-lang/rust", "tokio-rs/tokio", "serde-rs/serde"] {
        let id = fetch_repo.send(vec![json!(repo)], Map::new()).await?;
        tracing::info!(repo = %repo, id = %id, "enqueued");
    }

    worker.run().await?;
    Ok(())
}
