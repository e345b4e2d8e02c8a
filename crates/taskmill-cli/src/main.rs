//! taskmill queue administration.
//!
//! Usage:
//!   taskmill size <task_name>               Print ready-set length
//!   taskmill clear <task_name>              Delete a queue's keys
//!   taskmill requeue <task_name>            Reclaim stale processing entries
//!
//! Worker processes are user binaries linking the taskmill library; this
//! tool only administers the broker side.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use taskmill::{broker_from_url, Broker, RedisBroker, RedisBrokerConfig, DEFAULT_BROKER_URL};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskmill")]
#[command(about = "Administer taskmill broker queues", long_about = None)]
#[command(version)]
struct Cli {
    /// Broker URL (memory:// or redis://)
    #[arg(long, global = true, default_value = DEFAULT_BROKER_URL)]
    broker_url: String,

    /// Log filter (e.g. info, debug, taskmill=trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the number of ready messages in a queue
    Size { task_name: String },

    /// Delete a queue's ready and processing keys
    Clear { task_name: String },

    /// Move stale processing entries back into the ready set
    Requeue {
        task_name: String,

        /// Reclaim entries claimed more than this many seconds ago
        #[arg(long, default_value_t = 300)]
        older_than: u64,
    },
}

#[tokio::main]
async fn main() {
    // usage errors exit 1, matching operational failures
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Size { task_name } => {
            let broker = broker_from_url(&cli.broker_url).await?;
            println!("{}", broker.len(&task_name).await?);
            broker.close().await?;
        }
        Commands::Clear { task_name } => {
            let broker = broker_from_url(&cli.broker_url).await?;
            broker.clear(&task_name).await?;
            println!("cleared {}", task_name);
            broker.close().await?;
        }
        Commands::Requeue {
            task_name,
            older_than,
        } => {
            if !cli.broker_url.starts_with("redis://") {
                anyhow::bail!("requeue requires a redis broker url");
            }
            let broker = RedisBroker::new(RedisBrokerConfig {
                url: cli.broker_url.clone(),
                ..Default::default()
            })
            .await?;
            let moved = broker
                .requeue(&task_name, Duration::from_secs(older_than))
                .await?;
            println!("requeued {} message(s) for {}", moved, task_name);
            broker.close().await?;
        }
    }
    Ok(())
}
