//! Directory-swap checkpoints.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use super::{Checkpointable, validate_checkpoint_id};

const ACTIVE_DIR: &str = "active";
const CHECKPOINTS_DIR: &str = "checkpoints";

/// Checkpoints a directory tree rooted at `<root>/active`.
#[derive(Debug, Clone)]
pub struct DirectorySnapshots {
    root: PathBuf,
}

impl DirectorySnapshots {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join(ACTIVE_DIR)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR)
    }

    pub fn checkpoint_dir(&self, id: &str) -> PathBuf {
        self.checkpoints_dir().join(id)
    }

    /// Creates `active/` and `checkpoints/` if missing.
    pub async fn prepare(&self) -> UserEnvResult<()> {
        for dir in [self.active_dir(), self.checkpoints_dir()] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                UserEnvError::Storage(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Checkpoint ids currently on disk, sorted.
    #[cfg(test)]
    async fn list(&self) -> UserEnvResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.checkpoints_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn remove_active(&self) -> UserEnvResult<()> {
        let active = self.active_dir();
        match tokio::fs::remove_dir_all(&active).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UserEnvError::Storage(format!(
                "failed to remove {}: {}",
                active.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl Checkpointable for DirectorySnapshots {
    /// An empty `id` discards `active/` and returns an empty token.
    async fn create_checkpoint(&self, id: &str) -> UserEnvResult<String> {
        if id.is_empty() {
            self.remove_active().await?;
            tracing::info!(root = %self.root.display(), "Discarded active directory");
            return Ok(String::new());
        }
        validate_checkpoint_id(id)?;

        let target = self.checkpoint_dir(id);
        if tokio::fs::try_exists(&target).await? {
            return Err(UserEnvError::AlreadyExists(format!("checkpoint '{}'", id)));
        }
        self.prepare().await?;

        let active = self.active_dir();
        tokio::fs::rename(&active, &target).await.map_err(|e| {
            UserEnvError::Storage(format!(
                "failed to move {} to {}: {}",
                active.display(),
                target.display(),
                e
            ))
        })?;
        tokio::fs::create_dir_all(&active).await?;

        tracing::info!(checkpoint = id, root = %self.root.display(), "Created directory checkpoint");
        Ok(id.to_string())
    }

    async fn restore_to_checkpoint(&self, id: &str) -> UserEnvResult<()> {
        validate_checkpoint_id(id)?;

        let source = self.checkpoint_dir(id);
        if !tokio::fs::try_exists(&source).await? {
            return Err(UserEnvError::NotFound(format!("checkpoint '{}'", id)));
        }

        self.remove_active().await?;
        let active = self.active_dir();
        tokio::fs::rename(&source, &active).await.map_err(|e| {
            UserEnvError::Storage(format!(
                "failed to move {} to {}: {}",
                source.display(),
                active.display(),
                e
            ))
        })?;

        tracing::info!(checkpoint = id, root = %self.root.display(), "Restored directory checkpoint");
        Ok(())
    }
}
