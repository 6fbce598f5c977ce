//! Integration tests for the idempotency guard against a real Redis.
//!
//! Requires Docker for `testcontainers` to launch `redis:7-alpine`. Run with:
//! ```bash
//! cargo test --package idempotent-consumer --test integration_test -- --ignored --nocapture
//! ```

use idempotent_consumer::{ClaimOutcome, IdempotencyGuard};
use redis_utils::RedisPool;
use std::time::Duration;
use testcontainers::core::WaitFor;
use testcontainers::{runners::AsyncRunner, GenericImage};

async fn redis_guard(ttl: Duration) -> (impl Send, IdempotencyGuard) {
    let image = GenericImage::new("redis", "7-alpine")
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    let container = image.start().await.expect("failed to start redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("failed to map redis port");
    let url = format!("redis://127.0.0.1:{port}");

    let pool = RedisPool::connect(&url, None)
        .await
        .expect("failed to connect to containerized redis");
    let guard = IdempotencyGuard::new(pool.manager(), "orders.created", ttl);
    (container, guard)
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn first_claim_succeeds_second_is_duplicate() {
    let (_container, guard) = redis_guard(Duration::from_secs(2)).await;

    let key = IdempotencyGuard::event_key(Some("evt-1"), b"{}");
    assert_eq!(guard.claim(&key).await.unwrap(), ClaimOutcome::Claimed);
    assert_eq!(guard.claim(&key).await.unwrap(), ClaimOutcome::Duplicate);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_claims_only_one_wins() {
    let (_container, guard) = redis_guard(Duration::from_secs(5)).await;

    let key = IdempotencyGuard::event_key(Some("evt-concurrent"), b"{}");
    let mut handles = Vec::new();
    for _ in 0..10 {
        let guard = guard.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move { guard.claim(&key).await.unwrap() }));
    }

    let mut claimed = 0;
    let mut duplicate = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ClaimOutcome::Claimed => claimed += 1,
            ClaimOutcome::Duplicate => duplicate += 1,
        }
    }

    assert_eq!(claimed, 1, "exactly one concurrent claimer should win");
    assert_eq!(duplicate, 9);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn release_allows_reclaim() {
    let (_container, guard) = redis_guard(Duration::from_secs(5)).await;

    let key = IdempotencyGuard::event_key(Some("evt-release"), b"{}");
    assert_eq!(guard.claim(&key).await.unwrap(), ClaimOutcome::Claimed);
    guard.release(&key).await.unwrap();
    assert_eq!(
        guard.claim(&key).await.unwrap(),
        ClaimOutcome::Claimed,
        "releasing a claim must let a retried delivery reacquire it"
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn ttl_expiry_allows_reclaim() {
    let (_container, guard) = redis_guard(Duration::from_secs(1)).await;

    let key = IdempotencyGuard::event_key(Some("evt-ttl"), b"{}");
    assert_eq!(guard.claim(&key).await.unwrap(), ClaimOutcome::Claimed);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(
        guard.claim(&key).await.unwrap(),
        ClaimOutcome::Claimed,
        "an expired claim must not block a new delivery forever"
    );
}
