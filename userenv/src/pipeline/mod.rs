//! Sequential task pipeline with per-task timing.
//!
//! ```text
//! Pipeline → Tasks (run in order, first failure stops the run)
//! ```
//!
//! Used to run component setup: each task is one component's `setup`, and
//! the resulting [`PipelineMetrics`] are reported by the status endpoint.

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod task;

pub use metrics::{PipelineMetrics, TaskMetrics};
pub use pipeline::{Pipeline, PipelineExecutor};
pub use task::{BoxedTask, PipelineTask};
