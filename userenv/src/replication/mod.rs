//! Boundary to the external replication engine.
//!
//! A [`Replicator`] continuously ships a single SQLite file to the object
//! store and can materialize it again as of a chosen generation.

#[cfg(test)]
pub(crate) mod fake;
mod litestream;

pub use litestream::{
    DEFAULT_LITESTREAM_BIN, LitestreamReplicator, parse_generations, parse_wal_position,
};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use userenv_shared::errors::UserEnvResult;

use crate::storage::ObjectStorageConfig;

/// A point in a replicated file's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaPosition {
    pub generation: String,
    pub index: u64,
    pub offset: u64,
}

impl fmt::Display for ReplicaPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}:{}", self.generation, self.index, self.offset)
    }
}

#[async_trait]
pub trait Replicator: Send + Sync {
    /// False when no replica destination is known.
    fn is_configured(&self) -> bool;

    /// Begins continuous replication. Starting twice is not an error.
    async fn start(&self) -> UserEnvResult<()>;

    /// Stops continuous replication. Idempotent.
    async fn stop(&self) -> UserEnvResult<()>;

    fn is_running(&self) -> bool;

    /// Latest replicated position, `None` if nothing has been replicated.
    async fn position(&self) -> UserEnvResult<Option<ReplicaPosition>>;

    /// Generation ids present in the replica.
    async fn generations(&self) -> UserEnvResult<Vec<String>>;

    /// Materializes the replica into `output`, as of `generation` or the
    /// latest one. Returns `false` if the replica holds nothing to restore.
    async fn restore(&self, output: &Path, generation: Option<&str>) -> UserEnvResult<bool>;
}

/// Builds the replicator for one database: `(db_path, storage, replica_path)`.
pub type ReplicatorFactory =
    Arc<dyn Fn(&Path, &ObjectStorageConfig, &str) -> Arc<dyn Replicator> + Send + Sync>;

/// Factory producing [`LitestreamReplicator`]s that run `binary`.
pub fn litestream_factory(binary: impl Into<PathBuf>) -> ReplicatorFactory {
    let binary = binary.into();
    Arc::new(move |db_path: &Path, storage: &ObjectStorageConfig, replica_path: &str| {
        Arc::new(LitestreamReplicator::new(
            binary.clone(),
            db_path,
            Some(storage),
            replica_path,
        )) as Arc<dyn Replicator>
    })
}
