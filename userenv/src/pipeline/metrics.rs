use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u128> {
        self.tasks
            .iter()
            .find(|task| task.name == name)
            .map(|task| task.duration_ms)
    }
}
