//! Generation-addressed checkpoints for a replicated SQLite file.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use super::Checkpointable;
use crate::replication::{ReplicaPosition, Replicator};

/// Opaque handle returned by [`GenerationSnapshots::create_checkpoint`]:
/// `id:generation:index:offset:unix_ts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointToken {
    pub id: String,
    pub position: ReplicaPosition,
    pub created_at: i64,
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.id,
            self.position.generation,
            self.position.index,
            self.position.offset,
            self.created_at
        )
    }
}

impl FromStr for CheckpointToken {
    type Err = UserEnvError;

    /// Parsed from the right, so the caller's id may itself contain colons.
    fn from_str(s: &str) -> UserEnvResult<Self> {
        let not_found = || UserEnvError::NotFound(format!("checkpoint '{}'", s));

        let mut parts = s.rsplitn(5, ':');
        let (Some(created_at), Some(offset), Some(index), Some(generation), Some(id)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(not_found());
        };
        if generation.is_empty() {
            return Err(not_found());
        }

        Ok(Self {
            id: id.to_string(),
            position: ReplicaPosition {
                generation: generation.to_string(),
                index: index.parse().map_err(|_| not_found())?,
                offset: offset.parse().map_err(|_| not_found())?,
            },
            created_at: created_at.parse().map_err(|_| not_found())?,
        })
    }
}

/// Checkpoints a replicated database by recording replica positions.
pub struct GenerationSnapshots {
    db_path: PathBuf,
    replicator: Arc<dyn Replicator>,
}

impl GenerationSnapshots {
    pub fn new(db_path: impl Into<PathBuf>, replicator: Arc<dyn Replicator>) -> Self {
        Self {
            db_path: db_path.into(),
            replicator,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn require_configured(&self) -> UserEnvResult<()> {
        if self.replicator.is_configured() {
            Ok(())
        } else {
            Err(UserEnvError::NotConfigured(format!(
                "no replica configured for {}",
                self.db_path.display()
            )))
        }
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .db_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".restore");
        self.db_path.with_file_name(name)
    }

    fn sidecar(&self, suffix: &str) -> PathBuf {
        let mut name = self.db_path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Restores into a staging file, then swaps it over the live database.
    async fn materialize(&self, generation: Option<&str>) -> UserEnvResult<()> {
        let staging = self.staging_path();
        remove_if_exists(&staging).await?;

        if !self.replicator.restore(&staging, generation).await? {
            return Err(UserEnvError::NotFound(format!(
                "no replica to restore for {}",
                self.db_path.display()
            )));
        }

        for suffix in ["-wal", "-shm"] {
            remove_if_exists(&self.sidecar(suffix)).await?;
        }
        tokio::fs::rename(&staging, &self.db_path).await.map_err(|e| {
            UserEnvError::Storage(format!(
                "failed to replace {}: {}",
                self.db_path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> UserEnvResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Checkpointable for GenerationSnapshots {
    async fn create_checkpoint(&self, id: &str) -> UserEnvResult<String> {
        self.require_configured()?;

        let position = self.replicator.position().await?.ok_or_else(|| {
            UserEnvError::Replication(format!(
                "{} has not been replicated yet",
                self.db_path.display()
            ))
        })?;

        let token = CheckpointToken {
            id: id.to_string(),
            position,
            created_at: Utc::now().timestamp(),
        };
        tracing::info!(checkpoint = id, position = %token.position, "Recorded database checkpoint");
        Ok(token.to_string())
    }

    /// An empty `id` restores the latest generation.
    async fn restore_to_checkpoint(&self, id: &str) -> UserEnvResult<()> {
        self.require_configured()?;

        let generation = if id.is_empty() {
            None
        } else {
            let token: CheckpointToken = id.parse()?;
            let known = self.replicator.generations().await?;
            if !known.contains(&token.position.generation) {
                return Err(UserEnvError::NotFound(format!(
                    "generation {} for checkpoint '{}'",
                    token.position.generation, token.id
                )));
            }
            Some(token.position.generation)
        };

        self.replicator.stop().await?;
        let result = self.materialize(generation.as_deref()).await;

        // Replication resumes whether or not the swap succeeded.
        if let Err(e) = self.replicator.start().await {
            tracing::error!(db = %self.db_path.display(), error = %e, "Failed to restart replication after restore");
            result?;
            return Err(e);
        }

        result?;
        tracing::info!(
            db = %self.db_path.display(),
            generation = generation.as_deref().unwrap_or("latest"),
            "Restored database checkpoint"
        );
        Ok(())
    }
}
