//! [`Replicator`] backed by the `litestream` command-line tool.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use super::{ReplicaPosition, Replicator};
use crate::storage::ObjectStorageConfig;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};

/// Default binary name, resolved through `PATH`.
pub const DEFAULT_LITESTREAM_BIN: &str = "litestream";

/// Drives `litestream replicate` under a [`ProcessSupervisor`] and shells out
/// for `wal`, `generations` and `restore`.
pub struct LitestreamReplicator {
    binary: PathBuf,
    db_path: PathBuf,
    replica_url: Option<String>,
    envs: Vec<(String, String)>,
    supervisor: ProcessSupervisor,
}

impl std::fmt::Debug for LitestreamReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LitestreamReplicator")
            .field("binary", &self.binary)
            .field("db_path", &self.db_path)
            .field("replica_url", &self.replica_url)
            .finish()
    }
}

impl LitestreamReplicator {
    /// Replicator for `db_path` writing under `<key_prefix><replica_path>`.
    ///
    /// With no storage configuration the replicator is constructed but
    /// reports `is_configured() == false`.
    pub fn new(
        binary: impl Into<PathBuf>,
        db_path: impl Into<PathBuf>,
        storage: Option<&ObjectStorageConfig>,
        replica_path: &str,
    ) -> Self {
        let binary = binary.into();
        let db_path = db_path.into();
        let replica_url = storage.map(|cfg| replica_url(cfg, replica_path));
        let envs = storage
            .map(|cfg| {
                vec![
                    ("LITESTREAM_ACCESS_KEY_ID".to_string(), cfg.access_key.clone()),
                    ("LITESTREAM_SECRET_ACCESS_KEY".to_string(), cfg.secret_key.clone()),
                ]
            })
            .unwrap_or_default();

        let mut command = vec![
            binary.to_string_lossy().into_owned(),
            "replicate".to_string(),
            db_path.to_string_lossy().into_owned(),
        ];
        if let Some(url) = &replica_url {
            command.push(url.clone());
        }
        let supervisor =
            ProcessSupervisor::new(command, SupervisorConfig::default()).with_env(envs.clone());

        Self {
            binary,
            db_path,
            replica_url,
            envs,
            supervisor,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn replica_url(&self) -> Option<&str> {
        self.replica_url.as_deref()
    }

    fn require_url(&self) -> UserEnvResult<&str> {
        self.replica_url.as_deref().ok_or_else(|| {
            UserEnvError::NotConfigured(format!(
                "no replica configured for {}",
                self.db_path.display()
            ))
        })
    }

    async fn run(&self, args: &[&str]) -> UserEnvResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|e| {
                UserEnvError::Replication(format!(
                    "failed to run {} {}: {}",
                    self.binary.display(),
                    args.first().copied().unwrap_or_default(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(UserEnvError::Replication(format!(
                "{} {} exited with {}: {}",
                self.binary.display(),
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `s3://bucket/<prefix><path>?endpoint=...&region=...&forcePathStyle=true`
fn replica_url(cfg: &ObjectStorageConfig, replica_path: &str) -> String {
    let path = format!("{}{}", cfg.key_prefix, replica_path);
    format!(
        "s3://{}/{}?endpoint={}&region={}&forcePathStyle=true",
        cfg.bucket,
        path.trim_start_matches('/'),
        cfg.endpoint,
        cfg.region_or_default()
    )
}

/// Parses `litestream wal` output and returns the last listed position.
///
/// Columns are read from the right (`generation index offset size created`)
/// so a leading replica-name column is optional.
pub fn parse_wal_position(output: &str) -> Option<ReplicaPosition> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 {
                return None;
            }
            let n = parts.len();
            let index = parts[n - 4].parse().ok()?;
            let offset = parts[n - 3].parse().ok()?;
            Some(ReplicaPosition {
                generation: parts[n - 5].to_string(),
                index,
                offset,
            })
        })
        .last()
}

/// Parses `litestream generations` output into generation ids.
///
/// Rows end with `generation lag start end`.
pub fn parse_generations(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return None;
            }
            let generation = parts[parts.len() - 4];
            let is_id = !generation.is_empty() && generation.chars().all(|c| c.is_ascii_hexdigit());
            is_id.then(|| generation.to_string())
        })
        .collect()
}

#[async_trait]
impl Replicator for LitestreamReplicator {
    fn is_configured(&self) -> bool {
        self.replica_url.is_some()
    }

    async fn start(&self) -> UserEnvResult<()> {
        self.require_url()?;
        match self.supervisor.start().await {
            Ok(pid) => {
                tracing::info!(pid, db = %self.db_path.display(), "Started replication");
                Ok(())
            }
            Err(UserEnvError::AlreadyRunning) => Ok(()),
            Err(e) => Err(UserEnvError::Replication(e.to_string())),
        }
    }

    async fn stop(&self) -> UserEnvResult<()> {
        self.supervisor.stop().await?;
        tracing::info!(db = %self.db_path.display(), "Stopped replication");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    async fn position(&self) -> UserEnvResult<Option<ReplicaPosition>> {
        let url = self.require_url()?;
        let output = self.run(&["wal", url]).await?;
        Ok(parse_wal_position(&output))
    }

    async fn generations(&self) -> UserEnvResult<Vec<String>> {
        let url = self.require_url()?;
        let output = self.run(&["generations", url]).await?;
        Ok(parse_generations(&output))
    }

    async fn restore(&self, output: &Path, generation: Option<&str>) -> UserEnvResult<bool> {
        let url = self.require_url()?.to_string();
        let output_str = output.to_string_lossy().into_owned();

        let mut args: Vec<&str> = vec!["restore", "-o", &output_str];
        if let Some(generation) = generation {
            args.push("-generation");
            args.push(generation);
        }
        args.push("-if-replica-exists");
        args.push(&url);

        self.run(&args).await?;
        let restored = tokio::fs::try_exists(output).await.unwrap_or(false);
        tracing::info!(
            db = %self.db_path.display(),
            output = %output.display(),
            generation = generation.unwrap_or("latest"),
            restored,
            "Replica restore finished"
        );
        Ok(restored)
    }
}
