//! `filesystem` component: a JuiceFS mount with directory-swap checkpoints.
//!
//! Layout under the environment directory:
//!
//! ```text
//! <env_dir>/
//! ├── db/juicefs.sqlite   # metadata, replicated like the db component
//! └── juicefs/            # mount point
//!     ├── active/
//!     └── checkpoints/<id>/
//! ```

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::Instant;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use super::db::initialize_database;
use super::{StackComponent, StatusMap, status_of};
use crate::checkpoint::{Checkpointable, DirectorySnapshots};
use crate::replication::{Replicator, ReplicatorFactory};
use crate::storage::ObjectStorageConfig;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};

pub const FILESYSTEM_COMPONENT: &str = "filesystem";

pub const DEFAULT_JUICEFS_BIN: &str = "juicefs";

/// How long setup waits for the mount to appear.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(60);

const VOLUME_NAME: &str = "juicefs";
const META_REPLICA_PATH: &str = "juicefs-meta";
const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct FsState {
    mount_dir: PathBuf,
    replicator: Arc<dyn Replicator>,
    mount: ProcessSupervisor,
    snapshots: DirectorySnapshots,
}

#[derive(Serialize)]
struct FsStatus {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mount_dir: Option<PathBuf>,
    process_running: bool,
    replicating: bool,
}

pub struct FilesystemComponent {
    binary: PathBuf,
    replicators: ReplicatorFactory,
    mount_timeout: Duration,
    state: RwLock<Option<Arc<FsState>>>,
}

impl FilesystemComponent {
    pub fn new(binary: impl Into<PathBuf>, replicators: ReplicatorFactory) -> Self {
        Self {
            binary: binary.into(),
            replicators,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            state: RwLock::new(None),
        }
    }

    pub fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    fn current(&self) -> UserEnvResult<Arc<FsState>> {
        self.state.read().clone().ok_or_else(|| {
            UserEnvError::NotConfigured("filesystem component is not set up".into())
        })
    }

    async fn format(&self, storage: &ObjectStorageConfig, meta_url: &str) -> UserEnvResult<()> {
        let bucket_url = format!(
            "{}/{}",
            storage.endpoint.trim_end_matches('/'),
            storage.bucket
        );
        let output = Command::new(&self.binary)
            .args([
                "format",
                "--storage",
                "s3",
                "--bucket",
                &bucket_url,
                "--trash-days",
                "0",
                meta_url,
                VOLUME_NAME,
            ])
            .envs(credential_env(storage))
            .output()
            .await
            .map_err(|e| {
                UserEnvError::Spawn(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            return Err(UserEnvError::Storage(format!(
                "juicefs format exited with {}: {}{}",
                output.status,
                String::from_utf8_lossy(&output.stdout).trim(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::debug!(
            output = %String::from_utf8_lossy(&output.stdout).trim(),
            "juicefs format finished"
        );
        Ok(())
    }
}

fn credential_env(storage: &ObjectStorageConfig) -> Vec<(String, String)> {
    vec![
        ("AWS_ACCESS_KEY_ID".into(), storage.access_key.clone()),
        ("AWS_SECRET_ACCESS_KEY".into(), storage.secret_key.clone()),
        ("AWS_ENDPOINT_URL".into(), storage.endpoint.clone()),
        ("AWS_REGION".into(), storage.region_or_default().to_string()),
    ]
}

/// Waits until `mount_dir` sits on a different device than its parent.
pub(crate) async fn wait_for_mount(mount_dir: &Path, timeout: Duration) -> UserEnvResult<()> {
    let parent = mount_dir.parent().ok_or_else(|| {
        UserEnvError::InvalidArgument(format!("{} has no parent", mount_dir.display()))
    })?;
    let parent_dev = tokio::fs::metadata(parent).await?.dev();
    let deadline = Instant::now() + timeout;

    loop {
        if let Ok(meta) = tokio::fs::metadata(mount_dir).await {
            if meta.dev() != parent_dev {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(UserEnvError::Storage(format!(
                "mount at {} not ready after {:?}",
                mount_dir.display(),
                timeout
            )));
        }
        tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
    }
}

async fn stop_replication(replicator: &dyn Replicator) {
    if let Err(e) = replicator.stop().await {
        tracing::warn!(error = %e, "Failed to stop metadata replication");
    }
}

#[async_trait]
impl StackComponent for FilesystemComponent {
    fn name(&self) -> &str {
        FILESYSTEM_COMPONENT
    }

    async fn setup(&self, storage: &ObjectStorageConfig) -> UserEnvResult<()> {
        if self.state.read().is_some() {
            return Err(UserEnvError::AlreadyConfigured);
        }

        let env_dir = storage.env_dir();
        tokio::fs::create_dir_all(&env_dir).await?;
        let base = tokio::fs::canonicalize(&env_dir).await?;
        let mount_dir = base.join(VOLUME_NAME);
        let meta_db = base.join("db").join("juicefs.sqlite");
        tokio::fs::create_dir_all(&mount_dir).await?;

        let replicator = (self.replicators)(&meta_db, storage, META_REPLICA_PATH);
        initialize_database(&meta_db, replicator.as_ref()).await?;
        replicator.start().await?;

        let meta_url = format!("sqlite3://{}", meta_db.display());
        if let Err(e) = self.format(storage, &meta_url).await {
            stop_replication(replicator.as_ref()).await;
            return Err(e);
        }

        let mount = ProcessSupervisor::new(
            vec![
                self.binary.to_string_lossy().into_owned(),
                "mount".into(),
                "--no-syslog".into(),
                "--no-color".into(),
                meta_url,
                mount_dir.to_string_lossy().into_owned(),
            ],
            SupervisorConfig::default(),
        )
        .with_env(credential_env(storage));
        if let Err(e) = mount.start().await {
            stop_replication(replicator.as_ref()).await;
            return Err(e);
        }

        if let Err(e) = wait_for_mount(&mount_dir, self.mount_timeout).await {
            tracing::error!(error = %e, "juicefs mount did not become ready");
            if let Err(stop_err) = mount.stop().await {
                tracing::warn!(error = %stop_err, "Failed to stop juicefs mount");
            }
            stop_replication(replicator.as_ref()).await;
            return Err(e);
        }
        tracing::info!(mount_dir = %mount_dir.display(), "juicefs mounted");

        let snapshots = DirectorySnapshots::new(&mount_dir);
        snapshots.prepare().await?;

        *self.state.write() = Some(Arc::new(FsState {
            mount_dir,
            replicator,
            mount,
            snapshots,
        }));
        Ok(())
    }

    async fn cleanup(&self) -> UserEnvResult<()> {
        let state = self.state.write().take();
        let Some(state) = state else {
            return Ok(());
        };

        if let Err(e) = state.mount.stop().await {
            tracing::warn!(error = %e, "Failed to stop juicefs mount");
        }
        stop_replication(state.replicator.as_ref()).await;
        tracing::info!(mount_dir = %state.mount_dir.display(), "filesystem component cleaned up");
        Ok(())
    }

    fn status(&self) -> StatusMap {
        let state = self.state.read().clone();
        let status = match state {
            Some(state) => FsStatus {
                ready: true,
                mount_dir: Some(state.mount_dir.clone()),
                process_running: state.mount.is_running(),
                replicating: state.replicator.is_running(),
            },
            None => FsStatus {
                ready: false,
                mount_dir: None,
                process_running: false,
                replicating: false,
            },
        };
        status_of(&status)
    }

    fn checkpoints(&self) -> Option<&dyn Checkpointable> {
        Some(self)
    }
}

#[async_trait]
impl Checkpointable for FilesystemComponent {
    async fn create_checkpoint(&self, id: &str) -> UserEnvResult<String> {
        self.current()?.snapshots.create_checkpoint(id).await
    }

    async fn restore_to_checkpoint(&self, id: &str) -> UserEnvResult<()> {
        self.current()?.snapshots.restore_to_checkpoint(id).await
    }
}
