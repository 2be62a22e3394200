//! Error taxonomy for the userenv control plane.
//!
//! Variants are grouped the way callers react to them:
//! - configuration errors (caller sent bad input, nothing was persisted)
//! - conflict errors (lock held elsewhere, duplicate configuration)
//! - component and storage failures (surfaced with the underlying message)
//! - lock-protocol errors (timeouts, lost leases)

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UserEnvError {
    /// Malformed or incomplete configuration input.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A request argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration is write-once per process lifetime.
    #[error("already configured")]
    AlreadyConfigured,

    /// Environment and on-disk configuration were both present.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// An operation needs state that has not been configured yet.
    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("process is already running")]
    AlreadyRunning,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// The environment lock is held by another live holder.
    #[error("lock held by {0}")]
    LockHeld(String),

    #[error("timed out acquiring lock after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("lock lost: {0}")]
    LockLost(String),

    /// A conditional write lost its compare-and-swap race.
    #[error("precondition failed for {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error("database error: {0}")]
    Database(String),

    /// A stack component failed; carries the component name.
    #[error("component {component} failed: {message}")]
    Component { component: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UserEnvError {
    /// Wrap an error raised while a named component was working.
    ///
    /// Errors that already carry caller-facing meaning (not found, bad input,
    /// lock conflicts) pass through untouched so the HTTP layer can still map
    /// them to the right status code.
    pub fn in_component(self, component: &str) -> Self {
        match self {
            e @ (UserEnvError::NotFound(_)
            | UserEnvError::InvalidArgument(_)
            | UserEnvError::InvalidConfig(_)
            | UserEnvError::LockHeld(_)
            | UserEnvError::AlreadyExists(_)
            | UserEnvError::Component { .. }) => e,
            other => UserEnvError::Component {
                component: component.to_string(),
                message: other.to_string(),
            },
        }
    }
}

pub type UserEnvResult<T> = Result<T, UserEnvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_component_wraps_generic_errors() {
        let err = UserEnvError::Storage("bucket unreachable".into()).in_component("db");
        match err {
            UserEnvError::Component { component, message } => {
                assert_eq!(component, "db");
                assert!(message.contains("bucket unreachable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_in_component_keeps_not_found() {
        let err = UserEnvError::NotFound("checkpoint c1".into()).in_component("filesystem");
        assert!(matches!(err, UserEnvError::NotFound(_)));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::other("boom");
        let err: UserEnvError = io.into();
        assert!(err.to_string().contains("boom"));
    }
}
