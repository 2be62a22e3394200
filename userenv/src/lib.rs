//! userenv: control plane for a single-tenant, S3-backed sandbox environment.
//!
//! One externally supplied process runs under a [`supervisor::ProcessSupervisor`].
//! Its persistent state lives in stack components (a replicated SQLite
//! database, a network filesystem, an environment lease) that the
//! [`control::Control`] plane configures, checkpoints and restores through a
//! small admin HTTP API.

pub mod checkpoint;
pub mod components;
pub mod control;
pub mod db;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod replication;
pub mod storage;
pub mod supervisor;
pub mod util;

pub use userenv_shared::errors::{UserEnvError, UserEnvResult};
