//! Environment lock: a TTL lease stored as a single object.
//!
//! Only one host may be the active writer for an environment's remote state.
//! The lease is an object at `<key_prefix>fly.lock` whose body is a
//! [`LockRecord`]. Every mutation is a conditional write guarded by the ETag
//! last observed, so two parties can never both hold a live record.
//!
//! Release reads the record and deletes it only when it carries our identity.
//! Object stores without versioning cannot delete-if-ETag-matches, so a
//! takeover landing between that read and the delete is lost. The window is
//! bounded by one round trip and only opens after our own lease has expired.

mod options;
mod record;

pub use options::LockOptions;
pub use record::{LockIdentity, LockRecord};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use crate::storage::{ObjectStore, PutCondition};

/// Object name of the lease, appended to the environment's key prefix.
pub const LOCK_OBJECT_NAME: &str = "fly.lock";

/// How `acquire` reacts to a live lock held by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Return `LockHeld` right away.
    FailFast,
    /// Sleep and retry until the acquire timeout.
    Wait,
}

/// Result of [`EnvironmentLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Nothing to delete.
    AlreadyAbsent,
    /// The object belongs to someone else (or could not be read as ours)
    /// and was left in place.
    NotOwner(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaseState {
    Idle,
    Held {
        etag: String,
        expires_at: DateTime<Utc>,
    },
    Lost(String),
}

/// Snapshot of the local view of the lease.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub key: String,
    pub hostname: String,
    pub pid: u32,
    pub held: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_reason: Option<String>,
}

enum Attempt {
    Acquired(String, LockRecord),
    HeldBy(LockRecord),
    /// Someone else wrote between our read and our conditional write.
    Contended,
}

/// Shared between the lock handle and its renewal task.
struct LeaseCore {
    store: Arc<dyn ObjectStore>,
    key: String,
    identity: LockIdentity,
    options: LockOptions,
    state: Mutex<LeaseState>,
}

impl LeaseCore {
    async fn bounded<T>(
        &self,
        op: &str,
        fut: impl Future<Output = UserEnvResult<T>>,
    ) -> UserEnvResult<T> {
        tokio::time::timeout(self.options.op_timeout, fut)
            .await
            .map_err(|_| {
                UserEnvError::Storage(format!(
                    "{} {} timed out after {:?}",
                    op, self.key, self.options.op_timeout
                ))
            })?
    }

    async fn attempt(&self) -> UserEnvResult<Attempt> {
        let mine = LockRecord::new(&self.identity, self.options.ttl);
        let body = mine.to_string().into_bytes();

        let existing = self.bounded("get", self.store.get(&self.key)).await?;
        let condition_etag;
        let condition = match &existing {
            None => {
                tracing::debug!(key = %self.key, "No existing lock, creating");
                PutCondition::IfAbsent
            }
            Some(object) => {
                let text = String::from_utf8_lossy(&object.body);
                match text.parse::<LockRecord>() {
                    Ok(holder) if holder.is_expired() => {
                        tracing::info!(
                            key = %self.key,
                            holder = %holder.identity(),
                            expired_at = %holder.expires_at,
                            "Existing lock expired, taking over"
                        );
                    }
                    Ok(holder) if holder.is_owned_by(&self.identity) => {
                        tracing::info!(key = %self.key, "Lock already carries our identity, refreshing");
                    }
                    Ok(holder) => return Ok(Attempt::HeldBy(holder)),
                    Err(e) => {
                        tracing::warn!(
                            key = %self.key,
                            error = %e,
                            "Unparsable lock record, treating as stale"
                        );
                    }
                }
                condition_etag = object.etag.clone();
                PutCondition::IfMatch(&condition_etag)
            }
        };

        match self
            .bounded("put", self.store.put(&self.key, body, condition))
            .await
        {
            Ok(etag) => Ok(Attempt::Acquired(etag, mine)),
            Err(UserEnvError::PreconditionFailed(reason)) => {
                tracing::debug!(key = %self.key, %reason, "Lost lock race, re-reading");
                Ok(Attempt::Contended)
            }
            Err(e) => Err(e),
        }
    }

    /// Rewrites the record with a fresh expiry, guarded by the last ETag.
    async fn renew(&self) -> UserEnvResult<()> {
        let etag = match &*self.state.lock() {
            LeaseState::Held { etag, .. } => etag.clone(),
            LeaseState::Idle => return Err(UserEnvError::LockLost("lock not held".into())),
            LeaseState::Lost(reason) => return Err(UserEnvError::LockLost(reason.clone())),
        };

        let record = LockRecord::new(&self.identity, self.options.ttl);
        let new_etag = self
            .bounded(
                "renew",
                self.store.put(
                    &self.key,
                    record.to_string().into_bytes(),
                    PutCondition::IfMatch(&etag),
                ),
            )
            .await?;

        let mut state = self.state.lock();
        if matches!(*state, LeaseState::Held { .. }) {
            *state = LeaseState::Held {
                etag: new_etag,
                expires_at: record.expires_at,
            };
        }
        Ok(())
    }
}

/// Handle on the environment lease for one identity.
pub struct EnvironmentLock {
    core: Arc<LeaseCore>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl EnvironmentLock {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        key: impl Into<String>,
        identity: LockIdentity,
        options: LockOptions,
    ) -> Self {
        Self {
            core: Arc::new(LeaseCore {
                store,
                key: key.into(),
                identity,
                options,
                state: Mutex::new(LeaseState::Idle),
            }),
            renewal: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.core.key
    }

    pub fn identity(&self) -> &LockIdentity {
        &self.core.identity
    }

    /// Acquires the lease.
    ///
    /// A record that is expired or unparsable is overwritten with an If-Match
    /// on the ETag just read. Losing that race retries at once; a live
    /// foreign holder either fails (`FailFast`) or waits `retry_interval`
    /// (`Wait`) until `acquire_timeout` runs out.
    pub async fn acquire(&self, mode: AcquireMode) -> UserEnvResult<LockRecord> {
        let core = &self.core;
        let timeout = core.options.acquire_timeout;
        let deadline = Instant::now() + timeout;
        let mut attempt_no: u32 = 0;

        loop {
            if Instant::now() >= deadline {
                tracing::error!(key = %core.key, ?timeout, "Timed out acquiring lock");
                return Err(UserEnvError::LockTimeout(timeout));
            }
            attempt_no += 1;

            match core.attempt().await {
                Ok(Attempt::Acquired(etag, record)) => {
                    *core.state.lock() = LeaseState::Held {
                        etag,
                        expires_at: record.expires_at,
                    };
                    tracing::info!(
                        key = %core.key,
                        holder = %core.identity,
                        attempt = attempt_no,
                        expires_at = %record.expires_at,
                        "Lock acquired"
                    );
                    return Ok(record);
                }
                Ok(Attempt::Contended) => continue,
                Ok(Attempt::HeldBy(holder)) => {
                    if mode == AcquireMode::FailFast {
                        return Err(UserEnvError::LockHeld(holder.identity().to_string()));
                    }
                    tracing::info!(
                        key = %core.key,
                        holder = %holder.identity(),
                        expires_at = %holder.expires_at,
                        attempt = attempt_no,
                        "Lock held elsewhere, will retry"
                    );
                }
                Err(e) => {
                    if mode == AcquireMode::FailFast {
                        return Err(e);
                    }
                    tracing::warn!(key = %core.key, error = %e, attempt = attempt_no, "Lock attempt failed");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(core.options.retry_interval.min(remaining)).await;
        }
    }

    /// Starts the background renewal loop. A failed renewal marks the lease
    /// lost and ends the loop; nothing else is touched.
    pub fn start_renewal(&self) {
        let mut renewal = self.renewal.lock();
        if let Some(handle) = renewal.take() {
            handle.abort();
        }

        let core = Arc::clone(&self.core);
        *renewal = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.options.renew_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match core.renew().await {
                    Ok(()) => tracing::debug!(key = %core.key, "Lock renewed"),
                    Err(UserEnvError::LockLost(_)) => return,
                    Err(e) => {
                        tracing::warn!(key = %core.key, error = %e, "Lock renewal failed, lease lost");
                        *core.state.lock() = LeaseState::Lost(e.to_string());
                        return;
                    }
                }
            }
        }));
    }

    fn stop_renewal(&self) {
        if let Some(handle) = self.renewal.lock().take() {
            handle.abort();
        }
    }

    /// Performs one renewal immediately.
    pub async fn renew_now(&self) -> UserEnvResult<()> {
        match self.core.renew().await {
            Err(e @ UserEnvError::LockLost(_)) => Err(e),
            Err(e) => {
                *self.core.state.lock() = LeaseState::Lost(e.to_string());
                Err(UserEnvError::LockLost(e.to_string()))
            }
            Ok(()) => Ok(()),
        }
    }

    /// Releases the lease if the stored record still names us.
    pub async fn release(&self) -> UserEnvResult<ReleaseOutcome> {
        self.stop_renewal();
        let core = &self.core;

        let existing = core.bounded("get", core.store.get(&core.key)).await?;
        let outcome = match existing {
            None => {
                tracing::info!(key = %core.key, "Lock not found during release");
                ReleaseOutcome::AlreadyAbsent
            }
            Some(object) => {
                let text = String::from_utf8_lossy(&object.body);
                match text.parse::<LockRecord>() {
                    Ok(holder) if holder.is_owned_by(&core.identity) => {
                        core.bounded("delete", core.store.delete(&core.key)).await?;
                        tracing::info!(key = %core.key, holder = %core.identity, "Lock released");
                        ReleaseOutcome::Released
                    }
                    Ok(holder) => {
                        tracing::warn!(
                            key = %core.key,
                            ours = %core.identity,
                            found = %holder.identity(),
                            "Lock belongs to another holder, not deleting"
                        );
                        ReleaseOutcome::NotOwner(holder.identity().to_string())
                    }
                    Err(e) => {
                        tracing::warn!(key = %core.key, error = %e, "Unparsable lock record, not deleting");
                        ReleaseOutcome::NotOwner(e.to_string())
                    }
                }
            }
        };

        *core.state.lock() = LeaseState::Idle;
        Ok(outcome)
    }

    /// True while we believe we hold an unexpired lease.
    pub fn is_held(&self) -> bool {
        match &*self.core.state.lock() {
            LeaseState::Held { expires_at, .. } => Utc::now() <= *expires_at,
            _ => false,
        }
    }

    pub fn status(&self) -> LockStatus {
        let state = self.core.state.lock().clone();
        let (held, expires_at, lost_reason) = match state {
            LeaseState::Idle => (false, None, None),
            LeaseState::Held { expires_at, .. } => (Utc::now() <= expires_at, Some(expires_at), None),
            LeaseState::Lost(reason) => (false, None, Some(reason)),
        };
        LockStatus {
            key: self.core.key.clone(),
            hostname: self.core.identity.hostname.clone(),
            pid: self.core.identity.pid,
            held,
            expires_at,
            lost_reason,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.core.options.ttl
    }
}

impl Drop for EnvironmentLock {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;

    fn fast_options() -> LockOptions {
        LockOptions::with_ttl(Duration::from_secs(60))
            .acquire_timeout(Duration::from_millis(500))
            .retry_interval(Duration::from_millis(20))
    }

    fn lock_for(store: &Arc<InMemoryObjectStore>, host: &str, pid: u32) -> EnvironmentLock {
        EnvironmentLock::new(
            store.clone(),
            LOCK_OBJECT_NAME,
            LockIdentity::new(host, pid),
            fast_options(),
        )
    }

    async fn stored_record(store: &InMemoryObjectStore) -> LockRecord {
        let object = store.get(LOCK_OBJECT_NAME).await.unwrap().unwrap();
        String::from_utf8(object.body).unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_acquire_absent_then_release() {
        let store = Arc::new(InMemoryObjectStore::new());
        let lock = lock_for(&store, "a", 1);

        let record = lock.acquire(AcquireMode::FailFast).await.unwrap();
        assert!(lock.is_held());
        assert_eq!(stored_record(&store).await, record);

        assert_eq!(lock.release().await.unwrap(), ReleaseOutcome::Released);
        assert!(store.is_empty());
        assert!(!lock.is_held());

        assert_eq!(lock.release().await.unwrap(), ReleaseOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_live_lock_fails_fast() {
        let store = Arc::new(InMemoryObjectStore::new());
        let first = lock_for(&store, "a", 1);
        let second = lock_for(&store, "b", 2);

        first.acquire(AcquireMode::FailFast).await.unwrap();
        match second.acquire(AcquireMode::FailFast).await {
            Err(UserEnvError::LockHeld(holder)) => assert!(holder.contains("a (PID 1)")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let store = Arc::new(InMemoryObjectStore::new());
        let first = lock_for(&store, "a", 1);
        let second = lock_for(&store, "b", 2);

        first.acquire(AcquireMode::Wait).await.unwrap();
        assert!(matches!(
            second.acquire(AcquireMode::Wait).await,
            Err(UserEnvError::LockTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let store = Arc::new(InMemoryObjectStore::new());
        store
            .put(
                LOCK_OBJECT_NAME,
                b"old-host:7:1000".to_vec(),
                PutCondition::Always,
            )
            .await
            .unwrap();

        let lock = lock_for(&store, "new-host", 8);
        lock.acquire(AcquireMode::FailFast).await.unwrap();
        let record = stored_record(&store).await;
        assert_eq!(record.hostname, "new-host");
        assert_eq!(record.pid, 8);
    }

    #[tokio::test]
    async fn test_unparsable_lock_is_taken_over() {
        let store = Arc::new(InMemoryObjectStore::new());
        store
            .put(LOCK_OBJECT_NAME, b"not a lock".to_vec(), PutCondition::Always)
            .await
            .unwrap();

        let lock = lock_for(&store, "h", 3);
        lock.acquire(AcquireMode::FailFast).await.unwrap();
        assert!(stored_record(&store).await.is_owned_by(lock.identity()));
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_lock() {
        let store = Arc::new(InMemoryObjectStore::new());
        let lock = lock_for(&store, "a", 1);
        lock.acquire(AcquireMode::FailFast).await.unwrap();

        // Simulate takeover after our lease lapsed.
        let current = store.get(LOCK_OBJECT_NAME).await.unwrap().unwrap();
        let thief = LockRecord::new(&LockIdentity::new("b", 2), Duration::from_secs(60));
        store
            .put(
                LOCK_OBJECT_NAME,
                thief.to_string().into_bytes(),
                PutCondition::IfMatch(&current.etag),
            )
            .await
            .unwrap();

        assert!(matches!(
            lock.release().await.unwrap(),
            ReleaseOutcome::NotOwner(_)
        ));
        assert_eq!(stored_record(&store).await, thief);
    }

    #[tokio::test]
    async fn test_release_leaves_unparsable_record() {
        let store = Arc::new(InMemoryObjectStore::new());
        store
            .put(LOCK_OBJECT_NAME, b"???".to_vec(), PutCondition::Always)
            .await
            .unwrap();
        let lock = lock_for(&store, "a", 1);
        assert!(matches!(
            lock.release().await.unwrap(),
            ReleaseOutcome::NotOwner(_)
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_renew_updates_etag_and_detects_loss() {
        let store = Arc::new(InMemoryObjectStore::new());
        let lock = lock_for(&store, "a", 1);
        lock.acquire(AcquireMode::FailFast).await.unwrap();

        let before = store.get(LOCK_OBJECT_NAME).await.unwrap().unwrap().etag;
        lock.renew_now().await.unwrap();
        let after = store.get(LOCK_OBJECT_NAME).await.unwrap().unwrap().etag;
        assert_ne!(before, after);

        // An outside write invalidates our etag.
        store
            .put(LOCK_OBJECT_NAME, b"x:9:1".to_vec(), PutCondition::Always)
            .await
            .unwrap();
        assert!(matches!(
            lock.renew_now().await,
            Err(UserEnvError::LockLost(_))
        ));
        assert!(!lock.is_held());
        assert!(lock.status().lost_reason.is_some());
    }

    #[tokio::test]
    async fn test_background_renewal_marks_lost() {
        let store = Arc::new(InMemoryObjectStore::new());
        let mut options = fast_options();
        options.renew_interval = Duration::from_millis(30);
        let lock = EnvironmentLock::new(
            store.clone(),
            LOCK_OBJECT_NAME,
            LockIdentity::new("a", 1),
            options,
        );
        lock.acquire(AcquireMode::FailFast).await.unwrap();
        lock.start_renewal();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(lock.is_held());

        store.delete(LOCK_OBJECT_NAME).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!lock.is_held());
        assert!(lock.status().lost_reason.is_some());
    }

    #[tokio::test]
    async fn test_own_identity_takes_over() {
        let store = Arc::new(InMemoryObjectStore::new());
        let first = lock_for(&store, "a", 1);
        first.acquire(AcquireMode::FailFast).await.unwrap();

        let again = lock_for(&store, "a", 1);
        again.acquire(AcquireMode::FailFast).await.unwrap();
        assert!(again.is_held());
    }
}
