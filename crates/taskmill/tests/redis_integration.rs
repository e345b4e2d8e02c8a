//! Integration tests against a live Redis.
//!
//! Marked #[ignore] by default since they require running infrastructure:
//! `docker run -p 6379:6379 redis` then `cargo test -- --ignored`.

use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use taskmill::{Broker, Message, RedisBroker, RedisBrokerConfig, Worker};

async fn create_test_broker() -> RedisBroker {
    let config = RedisBrokerConfig {
        url: "redis://localhost:6379".to_string(),
        ..Default::default()
    };
    RedisBroker::new(config)
        .await
        .expect("Failed to connect to Redis")
}

fn message(task_name: &str) -> Message {
    Message::new(task_name, vec![json!(1)], Map::new())
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn publish_consume_ack_cycle() {
    let broker = create_test_broker().await;
    broker.clear("rt_cycle").await.unwrap();

    let sent = message("rt_cycle");
    broker.publish(&sent, Duration::ZERO).await.unwrap();
    assert_eq!(broker.len("rt_cycle").await.unwrap(), 1);

    let received = broker.consume("rt_cycle").await.unwrap();
    assert_eq!(received, sent);
    // claimed: out of the ready set, into processing
    assert_eq!(broker.len("rt_cycle").await.unwrap(), 0);

    broker.ack(&received).await.unwrap();
    broker.clear("rt_cycle").await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn delayed_message_stays_invisible() {
    let broker = create_test_broker().await;
    broker.clear("rt_delay").await.unwrap();

    broker
        .publish(&message("rt_delay"), Duration::from_millis(600))
        .await
        .unwrap();

    let early = tokio::time::timeout(Duration::from_millis(200), broker.consume("rt_delay")).await;
    assert!(early.is_err(), "consumed before the delay elapsed");

    let late = tokio::time::timeout(Duration::from_secs(3), broker.consume("rt_delay")).await;
    let received = late.expect("message never became visible").unwrap();
    broker.ack(&received).await.unwrap();

    broker.clear("rt_delay").await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn nack_after_ctx_mutation_requeues_once() {
    let broker = create_test_broker().await;
    broker.clear("rt_requeue").await.unwrap();

    let sent = message("rt_requeue");
    broker.publish(&sent, Duration::ZERO).await.unwrap();

    let mut claimed = broker.consume("rt_requeue").await.unwrap();
    claimed.ctx.tries += 1;
    broker.nack(&claimed, Duration::ZERO, false).await.unwrap();

    // exactly one copy came back, carrying the mutated ctx
    assert_eq!(broker.len("rt_requeue").await.unwrap(), 1);
    let again = broker.consume("rt_requeue").await.unwrap();
    assert_eq!(again.id, sent.id);
    assert_eq!(again.ctx.tries, 1);
    broker.ack(&again).await.unwrap();
    assert_eq!(broker.len("rt_requeue").await.unwrap(), 0);

    broker.clear("rt_requeue").await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn requeue_sweep_reclaims_stale_claims() {
    let broker = create_test_broker().await;
    broker.clear("rt_sweep").await.unwrap();

    broker.publish(&message("rt_sweep"), Duration::ZERO).await.unwrap();
    let _claimed = broker.consume("rt_sweep").await.unwrap();
    assert_eq!(broker.len("rt_sweep").await.unwrap(), 0);

    // nothing is young enough to reclaim yet
    let moved = broker
        .requeue("rt_sweep", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(moved, 0);

    // with a zero cutoff the claim counts as stale
    let moved = broker.requeue("rt_sweep", Duration::ZERO).await.unwrap();
    assert_eq!(moved, 1);
    assert_eq!(broker.len("rt_sweep").await.unwrap(), 1);

    broker.clear("rt_sweep").await.unwrap();
    broker.close().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn worker_executes_from_redis() {
    let worker_broker = Arc::new(create_test_broker().await);
    worker_broker.clear("rt_exec").await.unwrap();

    let mut worker = Worker::new("rt", worker_broker.clone()).with_concurrency(2);
    let executed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let task = {
        let executed = executed.clone();
        worker
            .register(
                "rt_exec",
                move |_args, _kwargs| {
                    let executed = executed.clone();
                    async move {
                        executed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    }
                },
                taskmill::TaskOptions::new(),
            )
            .unwrap()
    };
    task.send(vec![], Map::new()).await.unwrap();

    let worker = Arc::new(worker);
    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(executed.load(std::sync::atomic::Ordering::SeqCst), 1);

    worker.shutdown();
    runner.await.unwrap().unwrap();
}
