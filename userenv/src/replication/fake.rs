//! Scriptable replicator for tests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use userenv_shared::errors::UserEnvResult;

use super::{ReplicaPosition, Replicator, ReplicatorFactory};
use crate::storage::ObjectStorageConfig;

/// Records calls; "restores" by writing the generation name to the output.
#[derive(Debug, Default)]
pub(crate) struct FakeReplicator {
    pub configured: bool,
    pub generations: Vec<String>,
    pub position: Option<ReplicaPosition>,
    pub calls: Mutex<Vec<String>>,
    pub running: Mutex<bool>,
}

impl FakeReplicator {
    /// Configured, with two generations and a position in the first.
    pub fn populated() -> Self {
        Self {
            configured: true,
            generations: vec!["aaaa".into(), "bbbb".into()],
            position: Some(ReplicaPosition {
                generation: "aaaa".into(),
                index: 3,
                offset: 4096,
            }),
            ..Default::default()
        }
    }

    /// Configured, but the replica holds nothing yet.
    pub fn empty() -> Self {
        Self {
            configured: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Factory handing out this same instance for every database.
    pub fn factory(self: &Arc<Self>) -> ReplicatorFactory {
        let shared = Arc::clone(self);
        Arc::new(
            move |_db: &Path, _storage: &ObjectStorageConfig, _replica: &str| {
                Arc::clone(&shared) as Arc<dyn Replicator>
            },
        )
    }
}

#[async_trait]
impl Replicator for FakeReplicator {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn start(&self) -> UserEnvResult<()> {
        self.calls.lock().push("start".into());
        *self.running.lock() = true;
        Ok(())
    }

    async fn stop(&self) -> UserEnvResult<()> {
        self.calls.lock().push("stop".into());
        *self.running.lock() = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        *self.running.lock()
    }

    async fn position(&self) -> UserEnvResult<Option<ReplicaPosition>> {
        Ok(self.position.clone())
    }

    async fn generations(&self) -> UserEnvResult<Vec<String>> {
        Ok(self.generations.clone())
    }

    async fn restore(&self, output: &Path, generation: Option<&str>) -> UserEnvResult<bool> {
        let Some(latest) = self.generations.last() else {
            self.calls.lock().push("restore none".into());
            return Ok(false);
        };
        let generation = generation.unwrap_or(latest.as_str());
        self.calls.lock().push(format!("restore {}", generation));
        tokio::fs::write(output, generation).await?;
        Ok(true)
    }
}
