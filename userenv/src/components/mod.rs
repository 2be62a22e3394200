//! Stack components: named, pluggable units of environment functionality.
//!
//! A component is set up with the accepted storage configuration, reports a
//! status map, and is cleaned up on shutdown. Optional capabilities are
//! exposed through accessor methods rather than downcasts, so callers can
//! ask a component what it supports via [`ComponentDescriptor`].

mod db;
mod filesystem;
mod leaser;
mod registry;
mod setup;

pub use db::{DB_COMPONENT, DbComponent};
pub use filesystem::{
    DEFAULT_JUICEFS_BIN, DEFAULT_MOUNT_TIMEOUT, FILESYSTEM_COMPONENT, FilesystemComponent,
};
pub use leaser::{LEASER_COMPONENT, LeaserComponent};
pub use registry::ComponentRegistry;
pub use setup::{ComponentSetupTask, setup_components};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use userenv_shared::errors::UserEnvResult;

use crate::checkpoint::Checkpointable;
use crate::storage::ObjectStorageConfig;

/// Status payload reported by a component.
pub type StatusMap = Map<String, Value>;

/// Capability of components that hold a releasable lease.
#[async_trait]
pub trait LeaseHolder: Send + Sync {
    async fn release_lease(&self) -> UserEnvResult<()>;
}

#[async_trait]
pub trait StackComponent: Send + Sync {
    /// Fixed registry name, e.g. `"db"`.
    fn name(&self) -> &str;

    async fn setup(&self, storage: &ObjectStorageConfig) -> UserEnvResult<()>;

    async fn cleanup(&self) -> UserEnvResult<()>;

    fn status(&self) -> StatusMap;

    fn checkpoints(&self) -> Option<&dyn Checkpointable> {
        None
    }

    fn lease(&self) -> Option<&dyn LeaseHolder> {
        None
    }

    fn descriptor(&self) -> ComponentDescriptor {
        ComponentDescriptor {
            name: self.name().to_string(),
            checkpoint: self.checkpoints().is_some(),
            lease: self.lease().is_some(),
        }
    }
}

/// What a component can do, as reported to operators and used for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentDescriptor {
    pub name: String,
    pub checkpoint: bool,
    pub lease: bool,
}

/// Serializes `value` into a status map, or an `error` entry if it cannot be.
pub(crate) fn status_of<T: Serialize>(value: &T) -> StatusMap {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
        Err(e) => {
            let mut map = Map::new();
            map.insert("error".into(), Value::String(e.to_string()));
            map
        }
    }
}
