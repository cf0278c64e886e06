//! Distributed lock integration tests against a live NATS server with
//! JetStream enabled.
//!
//! Start one locally (`nats-server -js`) and run:
//! `cargo test -p nats-consumer -- --ignored`

use nats_consumer::lock::{DistributedLocks, LockConfig, LockDocument, LockStatus};
use nats_consumer::{NatsClient, NatsConfig, LOCK_BUCKET};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn nats_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

async fn connect(lock: LockConfig) -> NatsClient {
    NatsClient::connect(
        NatsConfig::new(nats_url())
            .with_name("lock-itest")
            .with_lock_config(lock),
    )
    .await
    .expect("Failed to connect to NATS for tests")
}

fn unique_key(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// Provision the lock bucket, the way a deployment pipeline would before
/// the service starts.
async fn provision_lock_bucket(client: &NatsClient) {
    let jetstream = client.jetstream();
    if jetstream.get_key_value(LOCK_BUCKET).await.is_err() {
        let _ = jetstream
            .create_key_value(async_nats::jetstream::kv::Config {
                bucket: LOCK_BUCKET.to_string(),
                ..Default::default()
            })
            .await;
    }
}

#[tokio::test]
#[ignore] // Requires actual NATS
async fn test_lock_lifecycle_across_owners() {
    let config = LockConfig::default()
        .with_lease(Duration::from_secs(20))
        .with_renew_interval(Duration::from_secs(10));
    let client_a = connect(config.clone()).await;
    let client_b = connect(config.clone()).await;
    let client_c = connect(config).await;
    provision_lock_bucket(&client_a).await;

    let key = unique_key("lifecycle");
    let other_key = unique_key("lifecycle-other");
    let cancel = CancellationToken::new();

    // A takes the lock.
    let handle_a = client_a
        .acquire_distributed_lock(&key, "owner-a", Duration::from_secs(2), &cancel)
        .await
        .unwrap()
        .expect("owner-a should acquire a free lock");

    // B cannot get it within 1.5s.
    let denied = client_b
        .acquire_distributed_lock(&key, "owner-b", Duration::from_millis(1500), &cancel)
        .await
        .unwrap();
    assert!(denied.is_none(), "owner-b acquired a held lock");

    assert_eq!(
        client_b.check_distributed_lock(&key, "owner-b").await.unwrap(),
        LockStatus::HeldByOther("owner-a".to_string())
    );

    // An unrelated key is immediately available to C.
    let handle_c = client_c
        .acquire_distributed_lock(&other_key, "owner-c", Duration::from_millis(500), &cancel)
        .await
        .unwrap()
        .expect("owner-c should acquire an unrelated key immediately");

    // After A releases, B succeeds on the next try.
    handle_a.release().await.unwrap();
    let handle_b = client_b
        .acquire_distributed_lock(&key, "owner-b", Duration::from_secs(2), &cancel)
        .await
        .unwrap()
        .expect("owner-b should acquire after release");

    handle_b.release().await.unwrap();
    handle_c.release().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires actual NATS
async fn test_acquire_release_acquire_same_owner() {
    let client = connect(LockConfig::default()).await;
    provision_lock_bucket(&client).await;
    let key = unique_key("reacquire");
    let cancel = CancellationToken::new();

    let first = client
        .acquire_distributed_lock(&key, "owner-x", Duration::from_secs(2), &cancel)
        .await
        .unwrap()
        .expect("first acquire");
    first.release().await.unwrap();

    let second = client
        .acquire_distributed_lock(&key, "owner-x", Duration::from_secs(2), &cancel)
        .await
        .unwrap()
        .expect("second acquire by the same owner");
    second.release().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires actual NATS
async fn test_renewal_keeps_lock_alive_past_lease() {
    let config = LockConfig::default().with_lease(Duration::from_secs(3));
    let client = connect(config).await;
    provision_lock_bucket(&client).await;
    let key = unique_key("renewal");
    let cancel = CancellationToken::new();

    let handle = client
        .acquire_distributed_lock(&key, "owner-r", Duration::from_secs(2), &cancel)
        .await
        .unwrap()
        .expect("acquire");

    // Wait past the original lease; the background renewal must keep
    // ownership.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        client.check_distributed_lock(&key, "owner-r").await.unwrap(),
        LockStatus::HeldBySelf
    );

    handle.release().await.unwrap();
    assert_eq!(
        client.check_distributed_lock(&key, "owner-r").await.unwrap(),
        LockStatus::Free
    );
}

#[tokio::test]
#[ignore] // Requires actual NATS
async fn test_expired_lease_is_stolen() {
    let client = connect(LockConfig::default()).await;
    provision_lock_bucket(&client).await;
    client.setup_kv_stores().await.unwrap();

    let key = unique_key("steal");
    let cancel = CancellationToken::new();

    // Plant a lease that expired a second ago, as a crashed holder would
    // leave behind.
    let store = client.key_value(LOCK_BUCKET).await.unwrap();
    let dead = LockDocument {
        owner: "crashed-holder".to_string(),
        expires_at_unix_ms: chrono::Utc::now().timestamp_millis() - 1000,
    };
    store
        .put(key.as_str(), serde_json::to_vec(&dead).unwrap().into())
        .await
        .unwrap();

    let handle = client
        .acquire_distributed_lock(&key, "owner-s", Duration::from_secs(2), &cancel)
        .await
        .unwrap()
        .expect("expired lease should be stolen");
    assert_eq!(handle.owner(), "owner-s");

    handle.release().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires actual NATS
async fn test_renew_fails_after_foreign_takeover() {
    let client = connect(LockConfig::default()).await;
    provision_lock_bucket(&client).await;
    client.setup_kv_stores().await.unwrap();
    let store = client.key_value(LOCK_BUCKET).await.unwrap();
    let locks = DistributedLocks::new(store.clone(), LockConfig::default());

    let key = unique_key("takeover");
    let cancel = CancellationToken::new();

    let handle = locks
        .try_acquire(&key, "owner-1", Duration::from_secs(2), &cancel)
        .await
        .unwrap()
        .expect("acquire");
    let stale_revision = handle.revision();

    // Someone overwrites the entry out from under us.
    let takeover = LockDocument::new("owner-2", Duration::from_secs(30));
    store
        .put(key.as_str(), serde_json::to_vec(&takeover).unwrap().into())
        .await
        .unwrap();

    let result = locks.renew(&key, stale_revision, "owner-1").await;
    assert!(result.is_err(), "renew must fail once the revision moved");

    // Best-effort release of a lost lock is not an error.
    locks.release(&key, stale_revision, "owner-1").await.unwrap();
    drop(handle);
}
