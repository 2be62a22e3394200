//! Shared fixtures for the admin API tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tower::ServiceExt;

use userenv::checkpoint::{Checkpointable, DirectorySnapshots};
use userenv::components::{ComponentRegistry, LeaserComponent, StackComponent, StatusMap};
use userenv::control::{Control, ControlSettings, SystemConfig};
use userenv::lock::{LockIdentity, LockOptions};
use userenv::storage::{InMemoryObjectStore, ObjectStorageConfig};
use userenv::supervisor::{ProcessSupervisor, SupervisorConfig};
use userenv::{UserEnvError, UserEnvResult};

pub const ADMIN_HOST: &str = "fly-app-controller";
pub const TOKEN: &str = "test-token";

/// Directory-swap component rooted at `<env_dir>/snap`.
#[derive(Default)]
pub struct SnapshotComponent {
    snapshots: RwLock<Option<DirectorySnapshots>>,
}

impl SnapshotComponent {
    fn current(&self) -> UserEnvResult<DirectorySnapshots> {
        self.snapshots
            .read()
            .clone()
            .ok_or_else(|| UserEnvError::NotConfigured("snap".into()))
    }
}

#[async_trait]
impl StackComponent for SnapshotComponent {
    fn name(&self) -> &str {
        "snap"
    }

    async fn setup(&self, storage: &ObjectStorageConfig) -> UserEnvResult<()> {
        let snapshots = DirectorySnapshots::new(storage.env_dir().join("snap"));
        snapshots.prepare().await?;
        *self.snapshots.write() = Some(snapshots);
        Ok(())
    }

    async fn cleanup(&self) -> UserEnvResult<()> {
        self.snapshots.write().take();
        Ok(())
    }

    fn status(&self) -> StatusMap {
        let mut map = StatusMap::new();
        map.insert("ready".into(), Value::Bool(self.snapshots.read().is_some()));
        map
    }

    fn checkpoints(&self) -> Option<&dyn Checkpointable> {
        Some(self)
    }
}

#[async_trait]
impl Checkpointable for SnapshotComponent {
    async fn create_checkpoint(&self, id: &str) -> UserEnvResult<String> {
        self.current()?.create_checkpoint(id).await
    }

    async fn restore_to_checkpoint(&self, id: &str) -> UserEnvResult<()> {
        self.current()?.restore_to_checkpoint(id).await
    }
}

/// Hands out `<id>@<n>` handles and restores only from those handles.
#[derive(Default)]
pub struct HandleComponent {
    issued: Mutex<Vec<String>>,
    pub restored: Mutex<Vec<String>>,
}

#[async_trait]
impl StackComponent for HandleComponent {
    fn name(&self) -> &str {
        "handles"
    }

    async fn setup(&self, _storage: &ObjectStorageConfig) -> UserEnvResult<()> {
        Ok(())
    }

    async fn cleanup(&self) -> UserEnvResult<()> {
        Ok(())
    }

    fn status(&self) -> StatusMap {
        StatusMap::new()
    }

    fn checkpoints(&self) -> Option<&dyn Checkpointable> {
        Some(self)
    }
}

#[async_trait]
impl Checkpointable for HandleComponent {
    async fn create_checkpoint(&self, id: &str) -> UserEnvResult<String> {
        let mut issued = self.issued.lock();
        let handle = format!("{}@{}", id, issued.len() + 1);
        issued.push(handle.clone());
        Ok(handle)
    }

    async fn restore_to_checkpoint(&self, id: &str) -> UserEnvResult<()> {
        if !self.issued.lock().iter().any(|h| h == id) {
            return Err(UserEnvError::NotFound(format!("checkpoint '{}'", id)));
        }
        self.restored.lock().push(id.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub control: Arc<Control>,
    pub app: Router,
    pub store: Arc<InMemoryObjectStore>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub handles: Arc<HandleComponent>,
}

impl Harness {
    pub fn new(env_dir: &Path) -> Self {
        let store = Arc::new(InMemoryObjectStore::new());
        let leaser = LeaserComponent::new(
            LockIdentity::new("test-host", 4242),
            LockOptions::with_ttl(Duration::from_secs(60))
                .acquire_timeout(Duration::from_millis(300))
                .retry_interval(Duration::from_millis(20)),
        )
        .with_store(store.clone());

        let handles = Arc::new(HandleComponent::default());
        let registry = ComponentRegistry::new(vec![
            Arc::new(leaser) as Arc<dyn StackComponent>,
            Arc::new(SnapshotComponent::default()),
            handles.clone(),
        ]);
        let supervisor = Arc::new(ProcessSupervisor::new(
            vec!["sleep".into(), "30".into()],
            SupervisorConfig::default().with_stop_timeout(Duration::from_secs(2)),
        ));
        let control = Arc::new(Control::new(
            ControlSettings {
                admin_host: ADMIN_HOST.into(),
                token: TOKEN.into(),
                env_dir: env_dir.to_path_buf(),
            },
            registry,
            Some(supervisor.clone()),
        ));

        Self {
            app: userenv::control::router(control.clone()),
            control,
            store,
            supervisor,
            handles,
        }
    }

    /// Resolves and applies startup configuration the way the server does.
    pub async fn bootstrap(&self, from_env: Option<SystemConfig>) -> UserEnvResult<()> {
        match self.control.resolve_startup(from_env).await? {
            Some(config) => self.control.apply_startup(config).await,
            None => Ok(()),
        }
    }

    pub async fn call(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.call_as(ADMIN_HOST, Some(TOKEN), method, path, body).await
    }

    pub async fn call_as(
        &self,
        host: &str,
        token: Option<&str>,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, host);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };

        let response = self
            .app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}

pub fn config_body(stacks: &[&str], bucket: &str) -> Value {
    json!({
        "storage": {
            "bucket": bucket,
            "endpoint": "http://localhost:9000",
            "access_key": "ak",
            "secret_key": "sk",
            "key_prefix": "env-1/"
        },
        "stacks": stacks,
    })
}
