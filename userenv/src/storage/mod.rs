//! Object store boundary.
//!
//! The environment lock and the replicas live in an S3-compatible bucket.
//! Everything above this module talks to [`ObjectStore`], which exposes just
//! the operations the lock protocol needs: read with ETag, conditional write
//! and delete.

mod config;
mod memory;
mod s3;

pub use config::{DEFAULT_ENV_DIR, DEFAULT_REGION, ObjectStorageConfig};
pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use userenv_shared::errors::UserEnvResult;

/// An object body together with the ETag it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub etag: String,
}

/// Precondition attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition<'a> {
    /// Unconditional write.
    Always,
    /// Only create; fail if the object already exists.
    IfAbsent,
    /// Only overwrite the version carrying this ETag.
    IfMatch(&'a str),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads `key`. `Ok(None)` when the object does not exist.
    async fn get(&self, key: &str) -> UserEnvResult<Option<StoredObject>>;

    /// Writes `key` and returns the new ETag.
    ///
    /// When `condition` does not hold, `PreconditionFailed` is returned and
    /// nothing changes.
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        condition: PutCondition<'_>,
    ) -> UserEnvResult<String>;

    /// Deletes `key`. Deleting an absent object is not an error.
    async fn delete(&self, key: &str) -> UserEnvResult<()>;
}
