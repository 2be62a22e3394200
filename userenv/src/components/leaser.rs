//! `leaser` component: holds the environment lock while the environment runs.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use super::{LeaseHolder, StackComponent, StatusMap, status_of};
use crate::lock::{
    AcquireMode, EnvironmentLock, LOCK_OBJECT_NAME, LockIdentity, LockOptions, ReleaseOutcome,
};
use crate::storage::{ObjectStorageConfig, ObjectStore, S3ObjectStore};

pub const LEASER_COMPONENT: &str = "leaser";

/// Acquires `<key_prefix>fly.lock` during setup and keeps it renewed.
pub struct LeaserComponent {
    identity: LockIdentity,
    options: LockOptions,
    mode: AcquireMode,
    store: Option<Arc<dyn ObjectStore>>,
    lock: RwLock<Option<Arc<EnvironmentLock>>>,
}

impl Default for LeaserComponent {
    fn default() -> Self {
        Self::new(LockIdentity::current(), LockOptions::default())
    }
}

impl LeaserComponent {
    pub fn new(identity: LockIdentity, options: LockOptions) -> Self {
        Self {
            identity,
            options,
            mode: AcquireMode::Wait,
            store: None,
            lock: RwLock::new(None),
        }
    }

    /// Use `store` instead of building an S3 client from the configuration.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_mode(mut self, mode: AcquireMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_held(&self) -> bool {
        self.lock.read().as_ref().is_some_and(|lock| lock.is_held())
    }

    fn store_for(&self, storage: &ObjectStorageConfig) -> UserEnvResult<Arc<dyn ObjectStore>> {
        match &self.store {
            Some(store) => Ok(Arc::clone(store)),
            None => Ok(Arc::new(S3ObjectStore::from_config(storage)?)),
        }
    }

    async fn release(&self) -> UserEnvResult<Option<ReleaseOutcome>> {
        let lock = self.lock.write().take();
        match lock {
            Some(lock) => Ok(Some(lock.release().await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StackComponent for LeaserComponent {
    fn name(&self) -> &str {
        LEASER_COMPONENT
    }

    async fn setup(&self, storage: &ObjectStorageConfig) -> UserEnvResult<()> {
        if self.lock.read().is_some() {
            return Err(UserEnvError::AlreadyConfigured);
        }

        let lock = Arc::new(EnvironmentLock::new(
            self.store_for(storage)?,
            storage.key(LOCK_OBJECT_NAME),
            self.identity.clone(),
            self.options,
        ));
        lock.acquire(self.mode).await?;
        lock.start_renewal();

        *self.lock.write() = Some(lock);
        Ok(())
    }

    async fn cleanup(&self) -> UserEnvResult<()> {
        if let Some(outcome) = self.release().await? {
            tracing::info!(?outcome, "leaser component cleaned up");
        }
        Ok(())
    }

    fn status(&self) -> StatusMap {
        match self.lock.read().as_ref() {
            Some(lock) => status_of(&lock.status()),
            None => {
                let mut map = StatusMap::new();
                map.insert("held".into(), Value::Bool(false));
                map
            }
        }
    }

    fn lease(&self) -> Option<&dyn LeaseHolder> {
        Some(self)
    }
}

#[async_trait]
impl LeaseHolder for LeaserComponent {
    async fn release_lease(&self) -> UserEnvResult<()> {
        match self.release().await? {
            Some(outcome) => {
                tracing::info!(?outcome, "Lease released on request");
                Ok(())
            }
            None => Err(UserEnvError::NotFound("no active lease".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;
    use std::time::Duration;

    fn storage() -> ObjectStorageConfig {
        ObjectStorageConfig {
            bucket: "b".into(),
            endpoint: "http://localhost:9000".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            region: String::new(),
            key_prefix: "env-1/".into(),
            env_dir: None,
        }
    }

    fn leaser(store: &Arc<InMemoryObjectStore>, pid: u32) -> LeaserComponent {
        LeaserComponent::new(
            LockIdentity::new("host", pid),
            LockOptions::with_ttl(Duration::from_secs(60))
                .acquire_timeout(Duration::from_millis(200))
                .retry_interval(Duration::from_millis(20)),
        )
        .with_store(store.clone())
    }

    #[tokio::test]
    async fn test_setup_acquires_prefixed_lock() {
        let store = Arc::new(InMemoryObjectStore::new());
        let component = leaser(&store, 1);

        component.setup(&storage()).await.unwrap();
        assert!(component.is_held());
        assert!(store.get("env-1/fly.lock").await.unwrap().is_some());
        assert_eq!(component.status()["held"], Value::Bool(true));
        assert!(component.descriptor().lease);

        component.cleanup().await.unwrap();
        assert!(store.is_empty());
        assert_eq!(component.status()["held"], Value::Bool(false));
    }

    #[tokio::test]
    async fn test_second_holder_times_out() {
        let store = Arc::new(InMemoryObjectStore::new());
        leaser(&store, 1).setup(&storage()).await.unwrap();

        let other = leaser(&store, 2);
        assert!(matches!(
            other.setup(&storage()).await,
            Err(UserEnvError::LockTimeout(_))
        ));
        assert!(!other.is_held());
    }

    #[tokio::test]
    async fn test_release_lease() {
        let store = Arc::new(InMemoryObjectStore::new());
        let component = leaser(&store, 1);
        assert!(matches!(
            component.release_lease().await,
            Err(UserEnvError::NotFound(_))
        ));

        component.setup(&storage()).await.unwrap();
        component.release_lease().await.unwrap();
        assert!(store.is_empty());
        assert!(!component.is_held());
    }
}
