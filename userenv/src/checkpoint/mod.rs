//! Checkpoint engines.
//!
//! Two ways to snapshot component state under a caller-chosen id:
//! - [`GenerationSnapshots`]: a continuously replicated SQLite file, addressed
//!   by replication generation.
//! - [`DirectorySnapshots`]: a directory tree, snapshotted by renaming
//!   `active/` into `checkpoints/<id>/`. Restoring moves the checkpoint back,
//!   so each checkpoint can be restored once.

mod directory;
mod generation;

pub use directory::DirectorySnapshots;
pub use generation::{CheckpointToken, GenerationSnapshots};

use async_trait::async_trait;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

/// Capability of components whose state can be checkpointed and restored.
#[async_trait]
pub trait Checkpointable: Send + Sync {
    /// Snapshots current state as `id` and returns an opaque token to
    /// restore it by.
    async fn create_checkpoint(&self, id: &str) -> UserEnvResult<String>;

    /// Replaces current state with checkpoint `id`.
    async fn restore_to_checkpoint(&self, id: &str) -> UserEnvResult<()>;
}

/// Rejects ids that would escape the checkpoints directory.
pub(crate) fn validate_checkpoint_id(id: &str) -> UserEnvResult<()> {
    if id.is_empty() {
        return Err(UserEnvError::InvalidArgument("checkpoint id is empty".into()));
    }
    if id == "." || id == ".." || id.contains('/') || id.contains('\\') || id.contains('\0') {
        return Err(UserEnvError::InvalidArgument(format!(
            "invalid checkpoint id '{}'",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_checkpoint_id() {
        assert!(validate_checkpoint_id("v1").is_ok());
        assert!(validate_checkpoint_id("2024-01-01T00:00:00").is_ok());
        for bad in ["", ".", "..", "a/b", "../etc", "a\0b"] {
            assert!(validate_checkpoint_id(bad).is_err(), "accepted {:?}", bad);
        }
    }
}
