//! End-to-end broker flows against a running Redis.
//!
//! Unit tests cover the pure pieces; the semantics that live in Redis
//! (dedup, priority scan, retry parking, scheduled promotion, token buckets)
//! need a real server. Run with:
//!
//! ```text
//! REDIS_HOST=localhost cargo test -p domain_dispatch -- --ignored --test-threads=1
//! ```
//!
//! Tests share database 15 and flush it, so they must run single-threaded.

use domain_dispatch::{
    BrokerClient, DispatchConfig, EmailJob, EnqueueOutcome, Priority, ProviderKind, RateLimit,
};
use serde_json::json;
use std::sync::Arc;

const TEST_DB: i64 = 15;

async fn test_broker(config: DispatchConfig) -> BrokerClient {
    let mut redis_config = core_config::redis::RedisConfig::default();
    redis_config.host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
    redis_config.db = TEST_DB;

    let client = redis::Client::open(redis_config.uri()).unwrap();
    let mut conn = redis::aio::ConnectionManager::new(client)
        .await
        .expect("these tests need a running Redis");
    let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();

    let broker = BrokerClient::connect(&redis_config, Arc::new(config))
        .await
        .unwrap();
    // Group creation must precede enqueues: groups start from the stream
    // tail, so earlier entries would be invisible to consumers.
    broker.ensure_groups().await.unwrap();
    broker
}

fn job(priority: Priority, tag: &str) -> EmailJob {
    EmailJob::new(
        vec![format!("{tag}@example.com")],
        "notification",
        json!({"subject": tag, "message": "integration"}),
        priority,
        ProviderKind::Smtp,
    )
    .unwrap()
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn duplicate_enqueue_adds_one_entry() {
    let broker = test_broker(DispatchConfig::default()).await;
    let j = job(Priority::Medium, "dedup");

    assert!(matches!(
        broker.enqueue(&j).await.unwrap(),
        EnqueueOutcome::Queued(_)
    ));
    assert_eq!(broker.enqueue(&j).await.unwrap(), EnqueueOutcome::Duplicate);

    let stats = broker.stats().await.unwrap();
    assert_eq!(stats.queue_depths["medium"], 1);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn high_priority_drains_before_medium_and_low() {
    let broker = test_broker(DispatchConfig::default()).await;

    for j in [
        job(Priority::Low, "l1"),
        job(Priority::Low, "l2"),
        job(Priority::Medium, "m1"),
        job(Priority::High, "h1"),
        job(Priority::High, "h2"),
    ] {
        broker.enqueue(&j).await.unwrap();
    }

    let first = broker.dequeue("it_worker", 5).await.unwrap();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|j| j.priority == Priority::High));

    // Entries stay pending until acked, so ack them before reading on.
    for mut j in first {
        broker.ack(&mut j, true).await.unwrap();
    }

    let second = broker.dequeue("it_worker", 5).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].priority, Priority::Medium);
    for mut j in second {
        broker.ack(&mut j, true).await.unwrap();
    }

    let third = broker.dequeue("it_worker", 5).await.unwrap();
    assert_eq!(third.len(), 2);
    assert!(third.iter().all(|j| j.priority == Priority::Low));
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn fifo_within_one_priority() {
    let broker = test_broker(DispatchConfig::default()).await;

    let first = job(Priority::Medium, "first");
    let second = job(Priority::Medium, "second");
    broker.enqueue(&first).await.unwrap();
    broker.enqueue(&second).await.unwrap();

    let read = broker.dequeue("it_worker", 10).await.unwrap();
    assert_eq!(read.len(), 2);
    assert_eq!(read[0].id, first.id);
    assert_eq!(read[1].id, second.id);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn failed_job_parks_in_retry_set_then_promotes() {
    let broker = test_broker(DispatchConfig::default()).await;

    let j = job(Priority::High, "retry");
    broker.enqueue(&j).await.unwrap();

    let mut read = broker.dequeue("it_worker", 1).await.unwrap().remove(0);
    read.last_error = Some("provider timeout".to_string());
    broker.ack(&mut read, false).await.unwrap();

    // Out of the live stream, into the retry set, failure counted.
    let stats = broker.stats().await.unwrap();
    assert_eq!(stats.queue_depths["high"], 0);
    assert_eq!(stats.retry_pending, 1);
    assert_eq!(stats.failed_today, 1);

    // Not due yet: first retry backoff is 20s.
    let now = chrono::Utc::now().timestamp();
    assert_eq!(broker.process_due_retries(now).await.unwrap(), 0);

    // Pretend the backoff elapsed; the job must land back in its stream.
    assert_eq!(broker.process_due_retries(now + 30).await.unwrap(), 1);
    let again = broker.dequeue("it_worker", 1).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, j.id);
    assert_eq!(again[0].retry_count, 1);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn exhausted_retries_dead_letter() {
    let mut config = DispatchConfig::default();
    config.retry_attempts = 1;
    let broker = test_broker(config).await;

    let j = job(Priority::Medium, "doomed");
    broker.enqueue(&j).await.unwrap();

    let mut read = broker.dequeue("it_worker", 1).await.unwrap().remove(0);
    read.last_error = Some("550 mailbox unavailable".to_string());
    broker.ack(&mut read, false).await.unwrap();

    let stats = broker.stats().await.unwrap();
    assert_eq!(stats.retry_pending, 0);
    assert_eq!(stats.dead_letters, 1);

    let entries = broker.dead_letters(10).await.unwrap();
    assert_eq!(entries[0].job.id, j.id);
    assert_eq!(
        entries[0].job.last_error.as_deref(),
        Some("550 mailbox unavailable")
    );

    // Terminal: nothing left to dequeue for this job.
    assert!(broker.dequeue("it_worker", 1).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn token_bucket_denies_when_empty() {
    let mut config = DispatchConfig::default();
    config
        .rate_limits
        .insert(ProviderKind::Smtp, RateLimit { bucket_size: 3, refill_rate: 60 });
    let broker = test_broker(config).await;

    assert!(broker.check_rate(ProviderKind::Smtp, 1).await.unwrap());
    assert!(broker.check_rate(ProviderKind::Smtp, 2).await.unwrap());
    // Bucket is empty now; a single token must be denied.
    assert!(!broker.check_rate(ProviderKind::Smtp, 1).await.unwrap());

    // Refill at 60/min restores a token within ~2 seconds.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    assert!(broker.check_rate(ProviderKind::Smtp, 1).await.unwrap());
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn scheduled_job_promotes_only_when_due() {
    let broker = test_broker(DispatchConfig::default()).await;

    let mut j = job(Priority::Medium, "later");
    let send_at = chrono::Utc::now() + chrono::Duration::seconds(90);
    j.scheduled_at = Some(send_at);
    broker.schedule(&j).await.unwrap();

    // A tick before the send time promotes nothing.
    let early = chrono::Utc::now().timestamp();
    assert_eq!(broker.promote_due_scheduled(early).await.unwrap(), 0);
    assert!(broker.dequeue("it_worker", 1).await.unwrap().is_empty());

    // A tick after the send time moves it into the live stream.
    assert_eq!(
        broker
            .promote_due_scheduled(send_at.timestamp() + 1)
            .await
            .unwrap(),
        1
    );
    let read = broker.dequeue("it_worker", 1).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].id, j.id);
    assert_eq!(read[0].template, "notification");
}
