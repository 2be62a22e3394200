//! `db` component: a local SQLite file kept replicated to object storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use super::{StackComponent, StatusMap, status_of};
use crate::checkpoint::{Checkpointable, GenerationSnapshots};
use crate::db::Database;
use crate::replication::{Replicator, ReplicatorFactory};
use crate::storage::ObjectStorageConfig;

pub const DB_COMPONENT: &str = "db";

/// Replica location under the environment's key prefix.
const REPLICA_PATH: &str = "db";

struct DbState {
    db_path: PathBuf,
    replicator: Arc<dyn Replicator>,
    snapshots: GenerationSnapshots,
    restored: bool,
}

#[derive(Serialize)]
struct DbStatus {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    db_path: Option<PathBuf>,
    replicating: bool,
    restored_from_replica: bool,
}

/// Restores the database from its replica on first setup, creates a fresh
/// one when no replica exists, then replicates it continuously.
pub struct DbComponent {
    db_path: Option<PathBuf>,
    replicators: ReplicatorFactory,
    state: RwLock<Option<Arc<DbState>>>,
}

impl DbComponent {
    /// `db_path` overrides the default `<env_dir>/db/app.sqlite`.
    pub fn new(db_path: Option<PathBuf>, replicators: ReplicatorFactory) -> Self {
        Self {
            db_path,
            replicators,
            state: RwLock::new(None),
        }
    }

    fn resolve_path(&self, storage: &ObjectStorageConfig) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| storage.env_dir().join("db").join("app.sqlite"))
    }

    fn current(&self) -> UserEnvResult<Arc<DbState>> {
        self.state
            .read()
            .clone()
            .ok_or_else(|| UserEnvError::NotConfigured("db component is not set up".into()))
    }
}

/// Brings `db_path` into existence: restored from `replicator` if it has a
/// copy, otherwise freshly created. Returns whether a restore happened.
pub(crate) async fn initialize_database(
    db_path: &Path,
    replicator: &dyn Replicator,
) -> UserEnvResult<bool> {
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if tokio::fs::try_exists(db_path).await? {
        tracing::info!(path = %db_path.display(), "Local database exists, skipping restore");
        return Ok(false);
    }

    if replicator.restore(db_path, None).await? {
        tracing::info!(path = %db_path.display(), "Database restored from replica");
        return Ok(true);
    }

    tracing::info!(path = %db_path.display(), "No replica found, creating new database");
    let path = db_path.to_path_buf();
    tokio::task::spawn_blocking(move || Database::create_fresh(&path).map(drop))
        .await
        .map_err(|e| UserEnvError::Internal(format!("database init task failed: {}", e)))??;
    Ok(false)
}

#[async_trait]
impl StackComponent for DbComponent {
    fn name(&self) -> &str {
        DB_COMPONENT
    }

    async fn setup(&self, storage: &ObjectStorageConfig) -> UserEnvResult<()> {
        if self.state.read().is_some() {
            return Err(UserEnvError::AlreadyConfigured);
        }

        let db_path = self.resolve_path(storage);
        let replicator = (self.replicators)(&db_path, storage, REPLICA_PATH);

        let restored = initialize_database(&db_path, replicator.as_ref()).await?;
        replicator.start().await?;

        let snapshots = GenerationSnapshots::new(&db_path, Arc::clone(&replicator));
        *self.state.write() = Some(Arc::new(DbState {
            db_path,
            replicator,
            snapshots,
            restored,
        }));
        Ok(())
    }

    async fn cleanup(&self) -> UserEnvResult<()> {
        let state = self.state.write().take();
        if let Some(state) = state {
            state.replicator.stop().await?;
            tracing::info!(path = %state.db_path.display(), "db component cleaned up");
        }
        Ok(())
    }

    fn status(&self) -> StatusMap {
        let state = self.state.read().clone();
        let status = match state {
            Some(state) => DbStatus {
                ready: true,
                db_path: Some(state.db_path.clone()),
                replicating: state.replicator.is_running(),
                restored_from_replica: state.restored,
            },
            None => DbStatus {
                ready: false,
                db_path: None,
                replicating: false,
                restored_from_replica: false,
            },
        };
        status_of(&status)
    }

    fn checkpoints(&self) -> Option<&dyn Checkpointable> {
        Some(self)
    }
}

#[async_trait]
impl Checkpointable for DbComponent {
    async fn create_checkpoint(&self, id: &str) -> UserEnvResult<String> {
        self.current()?.snapshots.create_checkpoint(id).await
    }

    async fn restore_to_checkpoint(&self, id: &str) -> UserEnvResult<()> {
        self.current()?.snapshots.restore_to_checkpoint(id).await
    }
}
