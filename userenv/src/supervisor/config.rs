//! Supervisor tunables.

use std::time::Duration;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(90);

/// Default pause before restarting a process that exited on its own.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Timing configuration for a [`ProcessSupervisor`](super::ProcessSupervisor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// How long `stop()` waits after SIGTERM before escalating to SIGKILL.
    pub stop_timeout: Duration,
    /// How long the supervision loop waits before restarting a crashed process.
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

impl SupervisorConfig {
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }
}
