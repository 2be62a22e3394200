//! Environment lock contention against a shared in-memory store.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use userenv::UserEnvError;
use userenv::lock::{AcquireMode, EnvironmentLock, LockIdentity, LockOptions, ReleaseOutcome};
use userenv::storage::{InMemoryObjectStore, ObjectStore};

const KEY: &str = "env-1/fly.lock";

fn lock(store: &Arc<InMemoryObjectStore>, host: &str, ttl: Duration) -> EnvironmentLock {
    EnvironmentLock::new(
        store.clone(),
        KEY,
        LockIdentity::new(host, 100),
        LockOptions::with_ttl(ttl)
            .acquire_timeout(Duration::from_secs(2))
            .retry_interval(Duration::from_millis(20)),
    )
}

#[tokio::test]
async fn test_concurrent_fail_fast_acquirers() {
    for _ in 0..20 {
        let store = Arc::new(InMemoryObjectStore::new());
        let locks: Vec<_> = (0..5)
            .map(|i| lock(&store, &format!("host-{i}"), Duration::from_secs(60)))
            .collect();

        let results = join_all(locks.iter().map(|l| l.acquire(AcquireMode::FailFast))).await;
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "{results:?}");
        for result in results.iter().filter(|r| r.is_err()) {
            assert!(matches!(result, Err(UserEnvError::LockHeld(_))));
        }
        assert_eq!(locks.iter().filter(|l| l.is_held()).count(), 1);
    }
}

#[tokio::test]
async fn test_waiting_acquirer_gets_lock_after_release() {
    let store = Arc::new(InMemoryObjectStore::new());
    let first = Arc::new(lock(&store, "host-a", Duration::from_secs(60)));
    let second = lock(&store, "host-b", Duration::from_secs(60));

    first.acquire(AcquireMode::FailFast).await.unwrap();

    let releaser = {
        let first = first.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            first.release().await.unwrap()
        })
    };

    let record = second.acquire(AcquireMode::Wait).await.unwrap();
    assert_eq!(record.hostname, "host-b");
    assert_eq!(releaser.await.unwrap(), ReleaseOutcome::Released);
    assert!(second.is_held());
    assert!(!first.is_held());
}

#[tokio::test]
async fn test_expired_lock_is_taken_over() {
    let store = Arc::new(InMemoryObjectStore::new());
    let stale = lock(&store, "host-a", Duration::from_secs(1));
    stale.acquire(AcquireMode::FailFast).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2100)).await;

    let fresh = lock(&store, "host-b", Duration::from_secs(60));
    fresh.acquire(AcquireMode::FailFast).await.unwrap();

    // The stale holder must not delete the new holder's record.
    assert!(matches!(
        stale.release().await.unwrap(),
        ReleaseOutcome::NotOwner(_)
    ));
    let body = store.get(KEY).await.unwrap().unwrap().body;
    assert!(String::from_utf8(body).unwrap().starts_with("host-b:100:"));
}
