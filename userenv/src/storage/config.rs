//! Object storage connection settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use userenv_shared::errors::{UserEnvError, UserEnvResult};

/// Region used when none is configured; S3-compatible stores accept it.
pub const DEFAULT_REGION: &str = "auto";

/// Default local environment directory.
pub const DEFAULT_ENV_DIR: &str = "/userenv";

/// Connection settings for the environment's backing object store.
///
/// Immutable once accepted by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub region: String,
    /// Prepended to every object key this environment writes.
    #[serde(default)]
    pub key_prefix: String,
    /// Local environment directory. Filled in from the server settings
    /// when absent from the posted document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_dir: Option<PathBuf>,
}

impl ObjectStorageConfig {
    /// Checks that every required connection field is non-empty.
    pub fn validate(&self) -> UserEnvResult<()> {
        let required = [
            ("bucket", &self.bucket),
            ("endpoint", &self.endpoint),
            ("access_key", &self.access_key),
            ("secret_key", &self.secret_key),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(UserEnvError::InvalidConfig(format!(
                "missing storage fields: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn region_or_default(&self) -> &str {
        if self.region.is_empty() {
            DEFAULT_REGION
        } else {
            &self.region
        }
    }

    /// Full object key for `name` under this environment's prefix.
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    pub fn env_dir(&self) -> PathBuf {
        self.env_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectStorageConfig {
        ObjectStorageConfig {
            bucket: "bucket".into(),
            endpoint: "http://localhost:9000".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            region: String::new(),
            key_prefix: "envs/one/".into(),
            env_dir: None,
        }
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        assert!(sample().validate().is_ok());

        let mut cfg = sample();
        cfg.bucket.clear();
        cfg.secret_key = "  ".into();
        match cfg.validate() {
            Err(UserEnvError::InvalidConfig(msg)) => {
                assert!(msg.contains("bucket"));
                assert!(msg.contains("secret_key"));
                assert!(!msg.contains("endpoint"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = sample();
        assert_eq!(cfg.region_or_default(), "auto");
        assert_eq!(cfg.key("fly.lock"), "envs/one/fly.lock");
        assert_eq!(cfg.env_dir(), PathBuf::from(DEFAULT_ENV_DIR));
    }

    #[test]
    fn test_missing_fields_deserialize_empty() {
        let cfg: ObjectStorageConfig = serde_json::from_str(r#"{"bucket":"b"}"#).unwrap();
        assert_eq!(cfg.bucket, "b");
        assert!(cfg.endpoint.is_empty());
        assert!(cfg.validate().is_err());
    }
}
