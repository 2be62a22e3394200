//! The environment's write-once configuration document.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use crate::storage::ObjectStorageConfig;

/// File name of the persisted configuration inside the environment directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

pub const ENV_BUCKET: &str = "FLY_STORAGE_BUCKET";
pub const ENV_ENDPOINT: &str = "FLY_STORAGE_ENDPOINT";
pub const ENV_ACCESS_KEY: &str = "FLY_STORAGE_ACCESS_KEY";
pub const ENV_SECRET_KEY: &str = "FLY_STORAGE_SECRET_KEY";
pub const ENV_REGION: &str = "FLY_STORAGE_REGION";
pub const ENV_KEY_PREFIX: &str = "FLY_STORAGE_KEY_PREFIX";
pub const ENV_STACKS: &str = "FLY_STACKS";

/// Storage settings plus the ordered list of stack components to set up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(alias = "Storage")]
    pub storage: ObjectStorageConfig,
    #[serde(default, alias = "Stacks")]
    pub stacks: Vec<String>,
}

impl SystemConfig {
    pub fn validate(&self) -> UserEnvResult<()> {
        self.storage.validate()?;
        if let Some(blank) = self.stacks.iter().find(|s| s.trim().is_empty()) {
            return Err(UserEnvError::InvalidConfig(format!(
                "empty stack name in {:?} ({:?})",
                self.stacks, blank
            )));
        }
        Ok(())
    }

    /// Reads a configuration from bootstrap environment variables.
    ///
    /// Returns `None` unless every required storage variable is set and
    /// non-empty.
    pub fn from_env_vars<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let storage = ObjectStorageConfig {
            bucket: get(ENV_BUCKET)?,
            endpoint: get(ENV_ENDPOINT)?,
            access_key: get(ENV_ACCESS_KEY)?,
            secret_key: get(ENV_SECRET_KEY)?,
            region: get(ENV_REGION).unwrap_or_default(),
            key_prefix: get(ENV_KEY_PREFIX).unwrap_or_default(),
            env_dir: None,
        };
        let stacks = get(ENV_STACKS)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self { storage, stacks })
    }

    /// Fills in the environment directory when the document left it out.
    pub fn with_default_env_dir(mut self, env_dir: &Path) -> Self {
        if self.storage.env_dir.is_none() {
            self.storage.env_dir = Some(env_dir.to_path_buf());
        }
        self
    }
}

pub fn config_path(env_dir: &Path) -> PathBuf {
    env_dir.join(CONFIG_FILE_NAME)
}

/// Loads the persisted configuration, if any.
pub async fn load(env_dir: &Path) -> UserEnvResult<Option<SystemConfig>> {
    let path = config_path(env_dir);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let config = serde_json::from_slice(&bytes).map_err(|e| {
        UserEnvError::InvalidConfig(format!("failed to parse {}: {}", path.display(), e))
    })?;
    Ok(Some(config))
}

/// Writes the configuration via a temporary file and rename.
pub async fn persist(env_dir: &Path, config: &SystemConfig) -> UserEnvResult<()> {
    tokio::fs::create_dir_all(env_dir).await?;
    let path = config_path(env_dir);
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(config)?;
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, &path).await?;
    tracing::info!(path = %path.display(), "Persisted configuration");
    Ok(())
}
