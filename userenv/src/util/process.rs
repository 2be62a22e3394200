//! Process utilities for PID liveness checks and signal delivery.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
///
/// # Returns
/// * `true` - Process exists
/// * `false` - Process does not exist or permission denied
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Deliver `sig` to `pid`.
pub fn send_signal(pid: u32, sig: Signal) -> UserEnvResult<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| UserEnvError::InvalidArgument(format!("pid {} out of range", pid)))?;
    signal::kill(Pid::from_raw(raw), sig).map_err(|e| {
        UserEnvError::Internal(format!("failed to send {:?} to pid {}: {}", sig, pid, e))
    })
}

/// Hostname of this machine, used as the lock identity.
///
/// Falls back to `unknown-host` when the kernel call fails.
pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "could not read hostname, using fallback");
            "unknown-host".to_string()
        }
    }
}
