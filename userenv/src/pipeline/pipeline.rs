//! Pipeline executor.

use std::time::Instant;

use super::metrics::{PipelineMetrics, TaskMetrics};
use super::task::BoxedTask;
use userenv_shared::errors::UserEnvResult;

pub struct Pipeline<Ctx> {
    tasks: Vec<BoxedTask<Ctx>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every task in order. The first failing task aborts the run and
    /// its error is returned; tasks already finished are not undone.
    pub async fn execute<Ctx>(pipeline: Pipeline<Ctx>, ctx: Ctx) -> UserEnvResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut task_metrics = Vec::with_capacity(pipeline.tasks.len());

        for task in pipeline.tasks {
            let name = task.name().to_string();
            let task_start = Instant::now();
            tracing::debug!(task = %name, "Running pipeline task");
            task.run(ctx.clone()).await?;
            let duration_ms = task_start.elapsed().as_millis();
            tracing::info!(task = %name, duration_ms, "Pipeline task finished");
            task_metrics.push(TaskMetrics { name, duration_ms });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            tasks: task_metrics,
        })
    }
}
