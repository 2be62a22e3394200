//! Component setup as a timed pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use userenv_shared::errors::UserEnvResult;

use super::StackComponent;
use crate::pipeline::{BoxedTask, Pipeline, PipelineExecutor, PipelineMetrics, PipelineTask};
use crate::storage::ObjectStorageConfig;

/// Runs one component's `setup`.
pub struct ComponentSetupTask {
    component: Arc<dyn StackComponent>,
}

impl ComponentSetupTask {
    pub fn new(component: Arc<dyn StackComponent>) -> Self {
        Self { component }
    }
}

#[async_trait]
impl PipelineTask<Arc<ObjectStorageConfig>> for ComponentSetupTask {
    async fn run(self: Box<Self>, storage: Arc<ObjectStorageConfig>) -> UserEnvResult<()> {
        let name = self.component.name().to_string();
        tracing::info!(component = %name, "Setting up component");
        self.component.setup(&storage).await.map_err(|e| {
            tracing::error!(component = %name, error = %e, "Component setup failed");
            e.in_component(&name)
        })
    }

    fn name(&self) -> &str {
        self.component.name()
    }
}

/// Sets up `components` in order. Stops at the first failure without
/// undoing earlier setups.
pub async fn setup_components(
    components: &[Arc<dyn StackComponent>],
    storage: &ObjectStorageConfig,
) -> UserEnvResult<PipelineMetrics> {
    let tasks: Vec<BoxedTask<Arc<ObjectStorageConfig>>> = components
        .iter()
        .map(|c| Box::new(ComponentSetupTask::new(Arc::clone(c))) as BoxedTask<_>)
        .collect();
    PipelineExecutor::execute(Pipeline::new(tasks), Arc::new(storage.clone())).await
}
