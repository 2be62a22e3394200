//! Control plane: owns the configuration lifecycle and orchestrates
//! components and the supervised process.
//!
//! Mutating operations (configure, checkpoint, restore, lease release,
//! shutdown) are serialized behind one async mutex. Status reads take a
//! snapshot that is swapped in whole, so they never observe a half-applied
//! mutation.
//!
//! Checkpoint and restore fan out across active components in setup order
//! and stop at the first failure. Work already done on earlier components is
//! not undone, and a failure is reported even if some components finished.
//! Restore does not pause the supervised process.
//!
//! Restore accepts either the caller's checkpoint id or the per-component
//! handles that checkpoint returned. Handles from checkpoints taken by this
//! process are remembered by id; after a restart only the handles work for
//! components whose handle differs from the id.

mod api;
pub mod config;
mod error;
mod state;

pub use api::router;
pub use config::SystemConfig;
pub use error::{ApiError, ApiResult, ErrorBody};
pub use state::ControlState;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use crate::components::{ComponentRegistry, StackComponent, setup_components};
use crate::pipeline::PipelineMetrics;
use crate::supervisor::ProcessSupervisor;

/// Server-level settings fixed at startup.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    /// Host header value the admin API answers to.
    pub admin_host: String,
    /// Static bearer token required on every admin request.
    pub token: String,
    /// Where `config.json` lives; also the default environment directory.
    pub env_dir: PathBuf,
}

#[derive(Clone, Default)]
struct Snapshot {
    state: ControlState,
    active: Vec<Arc<dyn StackComponent>>,
    setup: Option<PipelineMetrics>,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub configured: bool,
    pub running: bool,
    pub stacks: Vec<String>,
    pub components: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<PipelineMetrics>,
}

pub struct Control {
    settings: ControlSettings,
    registry: ComponentRegistry,
    supervisor: Option<Arc<ProcessSupervisor>>,
    snapshot: RwLock<Snapshot>,
    mutations: Mutex<()>,
    /// Set while a startup configuration is being applied.
    starting: AtomicBool,
    /// Component handles of checkpoints taken by this process, by id.
    handles: SyncMutex<HashMap<String, BTreeMap<String, String>>>,
}

impl Control {
    pub fn new(
        settings: ControlSettings,
        registry: ComponentRegistry,
        supervisor: Option<Arc<ProcessSupervisor>>,
    ) -> Self {
        Self {
            settings,
            registry,
            supervisor,
            snapshot: RwLock::new(Snapshot::default()),
            mutations: Mutex::new(()),
            starting: AtomicBool::new(false),
            handles: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    /// Reason the server refuses to serve, if configuration sources clash.
    pub fn conflict(&self) -> Option<String> {
        self.snapshot.read().state.conflict().map(str::to_string)
    }

    pub fn status(&self) -> StatusReport {
        let snapshot = self.snapshot.read().clone();
        let components = snapshot
            .active
            .iter()
            .map(|c| (c.name().to_string(), Value::Object(c.status())))
            .collect();

        StatusReport {
            configured: snapshot.state.is_configured(),
            running: self.supervisor.as_ref().is_some_and(|s| s.is_running()),
            stacks: snapshot
                .state
                .config()
                .map(|c| c.stacks.clone())
                .unwrap_or_default(),
            components,
            setup: snapshot.setup,
        }
    }

    /// Decides which startup configuration to apply, without applying it.
    ///
    /// `from_env` is the configuration read from bootstrap environment
    /// variables. If a persisted file exists as well, the control plane
    /// enters the conflict state and refuses every request. When a
    /// configuration is returned, operator POSTs are rejected until
    /// [`Control::apply_startup`] finishes.
    pub async fn resolve_startup(
        &self,
        from_env: Option<SystemConfig>,
    ) -> UserEnvResult<Option<SystemConfig>> {
        let persisted = config::load(&self.settings.env_dir).await?;
        let _guard = self.mutations.lock().await;

        let config = match (from_env, persisted) {
            (Some(_), Some(_)) => {
                let reason = format!(
                    "configuration found in both environment variables and {}",
                    config::config_path(&self.settings.env_dir).display()
                );
                tracing::error!(reason = %reason, "Refusing to start with conflicting configuration");
                self.snapshot.write().state = ControlState::Conflict(reason);
                return Ok(None);
            }
            (Some(config), None) => {
                tracing::info!("Configuring from environment variables");
                config
            }
            (None, Some(config)) => {
                tracing::info!("Configuring from persisted file");
                config
            }
            (None, None) => {
                tracing::info!("Waiting for configuration");
                return Ok(None);
            }
        };
        self.starting.store(true, Ordering::SeqCst);
        Ok(Some(config))
    }

    /// Applies a configuration returned by [`Control::resolve_startup`].
    ///
    /// Nothing is written to disk: the environment-variable path must find
    /// no file on the next start, and the file path already has one.
    pub async fn apply_startup(&self, config: SystemConfig) -> UserEnvResult<()> {
        let result = self.apply(config, false).await;
        self.starting.store(false, Ordering::SeqCst);
        result
    }

    /// Accepts a configuration posted by an operator.
    pub async fn configure(&self, config: SystemConfig) -> UserEnvResult<()> {
        self.apply(config, true).await
    }

    async fn apply(&self, config: SystemConfig, persist: bool) -> UserEnvResult<()> {
        let _guard = self.mutations.lock().await;

        match &self.snapshot.read().state {
            ControlState::Conflict(reason) => {
                return Err(UserEnvError::ConfigConflict(reason.clone()));
            }
            ControlState::Configured(_) => return Err(UserEnvError::AlreadyConfigured),
            ControlState::Unconfigured => {}
        }
        if persist && self.starting.load(Ordering::SeqCst) {
            return Err(UserEnvError::AlreadyConfigured);
        }

        let config = config.with_default_env_dir(&self.settings.env_dir);
        config.validate()?;
        let components = self.registry.resolve(&config.stacks)?;

        let metrics = match setup_components(&components, &config.storage).await {
            Ok(metrics) => metrics,
            Err(e) => {
                // Keep partially set up components visible so shutdown
                // still cleans them up.
                self.snapshot.write().active = components;
                return Err(e);
            }
        };

        if persist {
            config::persist(&self.settings.env_dir, &config).await?;
        }

        tracing::info!(
            stacks = ?config.stacks,
            total_ms = metrics.total_duration_ms,
            "Environment configured"
        );
        *self.snapshot.write() = Snapshot {
            state: ControlState::Configured(config),
            active: components,
            setup: Some(metrics),
        };

        if let Some(supervisor) = &self.supervisor {
            let pid = supervisor.start().await?;
            tracing::info!(pid, command = ?supervisor.command(), "Supervised process started");
        }
        Ok(())
    }

    fn configured_components(&self) -> UserEnvResult<Vec<Arc<dyn StackComponent>>> {
        let snapshot = self.snapshot.read();
        match &snapshot.state {
            ControlState::Configured(_) => Ok(snapshot.active.clone()),
            ControlState::Conflict(reason) => Err(UserEnvError::ConfigConflict(reason.clone())),
            ControlState::Unconfigured => {
                Err(UserEnvError::NotConfigured("environment is not configured".into()))
            }
        }
    }

    fn checkpointable(&self) -> UserEnvResult<Vec<Arc<dyn StackComponent>>> {
        let targets: Vec<_> = self
            .configured_components()?
            .into_iter()
            .filter(|c| c.checkpoints().is_some())
            .collect();
        if targets.is_empty() {
            return Err(UserEnvError::InvalidArgument(
                "no checkpointable components configured".into(),
            ));
        }
        Ok(targets)
    }

    /// Checkpoints every checkpointable component. Returns each
    /// component's checkpoint handle keyed by component name.
    pub async fn create_checkpoint(&self, id: &str) -> UserEnvResult<BTreeMap<String, String>> {
        require_id(id)?;
        let _guard = self.mutations.lock().await;

        let mut results = BTreeMap::new();
        for component in self.checkpointable()? {
            let Some(engine) = component.checkpoints() else {
                continue;
            };
            let name = component.name();
            let handle = engine
                .create_checkpoint(id)
                .await
                .map_err(|e| e.in_component(name))?;
            tracing::info!(component = name, checkpoint = id, handle = %handle, "Checkpoint created");
            results.insert(name.to_string(), handle);
        }
        self.handles.lock().insert(id.to_string(), results.clone());
        Ok(results)
    }

    pub async fn restore(&self, id: &str) -> UserEnvResult<()> {
        require_id(id)?;
        let _guard = self.mutations.lock().await;

        let handles = self.handles.lock().get(id).cloned().unwrap_or_default();
        for component in self.checkpointable()? {
            let Some(engine) = component.checkpoints() else {
                continue;
            };
            let name = component.name();
            let handle = handles.get(name).map_or(id, String::as_str);
            engine
                .restore_to_checkpoint(handle)
                .await
                .map_err(|e| e.in_component(name))?;
            tracing::info!(component = name, checkpoint = id, handle, "Checkpoint restored");
        }
        Ok(())
    }

    /// Releases the lease held by the first lease-holding component, or by
    /// the component called `name` when given.
    pub async fn release_lease(&self, name: Option<&str>) -> UserEnvResult<String> {
        let _guard = self.mutations.lock().await;

        let component = self
            .configured_components()?
            .into_iter()
            .filter(|c| c.lease().is_some())
            .find(|c| name.is_none_or(|n| c.name() == n))
            .ok_or_else(|| match name {
                Some(n) => UserEnvError::NotFound(format!("no active lease component '{}'", n)),
                None => UserEnvError::NotFound("no active lease component".into()),
            })?;

        let component_name = component.name().to_string();
        if let Some(holder) = component.lease() {
            holder
                .release_lease()
                .await
                .map_err(|e| e.in_component(&component_name))?;
        }
        Ok(component_name)
    }

    /// Stops the supervised process, then cleans components up in reverse
    /// setup order. Cleanup errors are logged, not returned.
    pub async fn shutdown(&self) {
        let _guard = self.mutations.lock().await;

        if let Some(supervisor) = &self.supervisor {
            if let Err(e) = supervisor.stop().await {
                tracing::warn!(error = %e, "Failed to stop supervised process");
            }
        }

        let active = std::mem::take(&mut self.snapshot.write().active);
        for component in active.iter().rev() {
            if let Err(e) = component.cleanup().await {
                tracing::warn!(component = component.name(), error = %e, "Component cleanup failed");
            }
        }
        tracing::info!("Control plane shut down");
    }
}

fn require_id(id: &str) -> UserEnvResult<()> {
    if id.trim().is_empty() {
        Err(UserEnvError::InvalidArgument("checkpoint_id is required".into()))
    } else {
        Ok(())
    }
}
