//! Process supervision for the user's main command.
//!
//! A [`ProcessSupervisor`] launches one command, restarts it after an
//! unexpected exit, and stops it gracefully on request. Restarts are driven by
//! a single supervision task per `start()`; `stop()` signals that task and
//! waits for it to finish, so no restart can begin after `stop()` returns.

mod config;
mod spawn;

pub use config::{DEFAULT_RESTART_DELAY, DEFAULT_STOP_TIMEOUT, SupervisorConfig};

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use parking_lot::Mutex;
use serde::Serialize;
use spawn::{Launch, spawn_process};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use crate::util::{is_process_alive, send_signal};

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    /// Exited on its own; a restart is pending.
    ExitedUnexpectedly,
    Stopping,
    Stopped,
}

#[derive(Debug)]
struct Shared {
    state: ProcessState,
    pid: Option<u32>,
    stop_requested: bool,
    restarts: u64,
}

struct Supervision {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Supervises a single long-running command.
pub struct ProcessSupervisor {
    launch: Launch,
    config: SupervisorConfig,
    shared: Arc<Mutex<Shared>>,
    /// Serializes start/stop and owns the running supervision loop.
    lifecycle: tokio::sync::Mutex<Option<Supervision>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("command", &self.launch.command)
            .field("config", &self.config)
            .field("shared", &*self.shared.lock())
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(command: Vec<String>, config: SupervisorConfig) -> Self {
        Self {
            launch: Launch {
                command,
                envs: Vec::new(),
            },
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: ProcessState::NotStarted,
                pid: None,
                stop_requested: false,
                restarts: 0,
            })),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    /// Extra environment variables for every launch of the command.
    pub fn with_env(mut self, envs: Vec<(String, String)>) -> Self {
        self.launch.envs = envs;
        self
    }

    pub fn command(&self) -> &[String] {
        &self.launch.command
    }

    /// Launches the command and begins supervising it.
    ///
    /// Spawn failures are returned directly; no supervision loop is left
    /// behind in that case.
    pub async fn start(&self) -> UserEnvResult<u32> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(UserEnvError::AlreadyRunning);
        }
        self.launch.validate()?;

        let child = spawn_process(&self.launch)?;
        let pid = child
            .id()
            .ok_or_else(|| UserEnvError::Spawn("process exited before reporting a pid".into()))?;

        {
            let mut shared = self.shared.lock();
            shared.state = ProcessState::Running;
            shared.pid = Some(pid);
            shared.stop_requested = false;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            child,
            self.launch.clone(),
            self.config,
            Arc::clone(&self.shared),
            stop_rx,
        ));
        *lifecycle = Some(Supervision { stop_tx, task });

        tracing::info!(pid, command = ?self.launch.command, "Started supervised process");
        Ok(pid)
    }

    /// Stops the process: SIGTERM, then SIGKILL after `stop_timeout`.
    ///
    /// Idempotent. Returns once the process has been reaped and the
    /// supervision loop has exited.
    pub async fn stop(&self) -> UserEnvResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(supervision) = lifecycle.take() else {
            return Ok(());
        };

        {
            let mut shared = self.shared.lock();
            shared.stop_requested = true;
            if matches!(
                shared.state,
                ProcessState::Running | ProcessState::ExitedUnexpectedly
            ) {
                shared.state = ProcessState::Stopping;
            }
        }

        let _ = supervision.stop_tx.send(true);
        supervision
            .task
            .await
            .map_err(|e| UserEnvError::Internal(format!("supervision task failed: {}", e)))?;

        tracing::info!(command = ?self.launch.command, "Supervised process stopped");
        Ok(())
    }

    /// Delivers `sig` to the current child, if there is one.
    pub fn forward_signal(&self, sig: Signal) -> UserEnvResult<()> {
        let pid = self.shared.lock().pid;
        match pid {
            Some(pid) => {
                tracing::debug!(pid, signal = ?sig, "Forwarding signal to supervised process");
                send_signal(pid, sig)
            }
            None => Ok(()),
        }
    }

    /// True only if the state is `Running` and the PID is alive.
    pub fn is_running(&self) -> bool {
        let shared = self.shared.lock();
        shared.state == ProcessState::Running && shared.pid.is_some_and(is_process_alive)
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.lock().pid
    }

    pub fn state(&self) -> ProcessState {
        self.shared.lock().state
    }

    /// Number of restarts performed since construction.
    pub fn restart_count(&self) -> u64 {
        self.shared.lock().restarts
    }
}

enum Event {
    Exited(std::io::Result<ExitStatus>),
    StopRequested,
}

async fn supervise(
    mut child: Child,
    launch: Launch,
    config: SupervisorConfig,
    shared: Arc<Mutex<Shared>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            status = child.wait() => Event::Exited(status),
            _ = stop_rx.changed() => Event::StopRequested,
        };

        match event {
            Event::StopRequested => {
                terminate(&mut child, config.stop_timeout).await;
                let mut shared = shared.lock();
                shared.pid = None;
                shared.state = ProcessState::Stopped;
                return;
            }
            Event::Exited(status) => {
                let restart = {
                    let mut shared = shared.lock();
                    shared.pid = None;
                    if shared.stop_requested {
                        shared.state = ProcessState::Stopped;
                        false
                    } else {
                        shared.state = ProcessState::ExitedUnexpectedly;
                        true
                    }
                };
                match status {
                    Ok(status) if restart => {
                        tracing::warn!(%status, "Supervised process exited unexpectedly")
                    }
                    Ok(status) => tracing::info!(%status, "Supervised process exited"),
                    Err(e) => tracing::warn!(error = %e, "Failed to wait on supervised process"),
                }
                if !restart {
                    return;
                }
                match respawn(&launch, config.restart_delay, &shared, &mut stop_rx).await {
                    Some(next) => child = next,
                    None => return,
                }
            }
        }
    }
}

/// Waits out the restart delay, then relaunches unless a stop arrived.
/// Spawn failures are retried after another delay.
async fn respawn(
    launch: &Launch,
    delay: Duration,
    shared: &Mutex<Shared>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Option<Child> {
    loop {
        let stopped = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = stop_rx.changed() => true,
        };

        let mut guard = shared.lock();
        if stopped || guard.stop_requested {
            guard.state = ProcessState::Stopped;
            return None;
        }

        match spawn_process(launch) {
            Ok(child) => {
                guard.pid = child.id();
                guard.state = ProcessState::Running;
                guard.restarts += 1;
                tracing::info!(
                    pid = ?guard.pid,
                    restarts = guard.restarts,
                    "Restarted supervised process"
                );
                return Some(child);
            }
            Err(e) => {
                tracing::error!(error = %e, "Restart failed, retrying");
            }
        }
    }
}

async fn terminate(child: &mut Child, timeout: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    if let Err(e) = send_signal(pid, Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "SIGTERM failed");
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(pid, %status, "Process exited after SIGTERM"),
        Ok(Err(e)) => tracing::warn!(pid, error = %e, "Wait after SIGTERM failed"),
        Err(_) => {
            tracing::warn!(
                pid,
                timeout_secs = timeout.as_secs_f64(),
                "Process ignored SIGTERM, sending SIGKILL"
            );
            if let Err(e) = child.start_kill() {
                tracing::warn!(pid, error = %e, "SIGKILL failed");
            }
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig::default()
            .with_stop_timeout(Duration::from_secs(5))
            .with_restart_delay(Duration::from_millis(50))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let sup = ProcessSupervisor::new(vec!["sleep".into(), "30".into()], fast_config());
        assert_eq!(sup.state(), ProcessState::NotStarted);
        assert!(!sup.is_running());

        let pid = sup.start().await.unwrap();
        assert!(sup.is_running());
        assert_eq!(sup.pid(), Some(pid));

        sup.stop().await.unwrap();
        assert!(!sup.is_running());
        assert_eq!(sup.state(), ProcessState::Stopped);
        assert_eq!(sup.pid(), None);
        assert!(!is_process_alive(pid));

        // Second stop is a no-op.
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let sup = ProcessSupervisor::new(vec!["true".into()], fast_config());
        sup.stop().await.unwrap();
        assert_eq!(sup.state(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let sup = ProcessSupervisor::new(vec!["sleep".into(), "30".into()], fast_config());
        sup.start().await.unwrap();
        assert!(matches!(
            sup.start().await,
            Err(UserEnvError::AlreadyRunning)
        ));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_command() {
        let sup = ProcessSupervisor::new(vec![], fast_config());
        assert!(matches!(
            sup.start().await,
            Err(UserEnvError::InvalidCommand(_))
        ));
        assert_eq!(sup.state(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let sup = ProcessSupervisor::new(
            vec!["/nonexistent/userenv-supervisor-test".into()],
            fast_config(),
        );
        assert!(matches!(sup.start().await, Err(UserEnvError::Spawn(_))));
        assert_eq!(sup.state(), ProcessState::NotStarted);
        // No loop was left behind, so a later stop is still a no-op.
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restarts_after_unexpected_exit() {
        let sup = ProcessSupervisor::new(sh("sleep 0.2"), fast_config());
        let first = sup.start().await.unwrap();

        let restarted = wait_until(
            || sup.restart_count() >= 1 && sup.pid().is_some_and(|p| p != first),
            Duration::from_secs(5),
        )
        .await;
        assert!(restarted, "process was not restarted");

        sup.stop().await.unwrap();
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_no_restart_after_stop() {
        let sup = ProcessSupervisor::new(vec!["sleep".into(), "30".into()], fast_config());
        sup.start().await.unwrap();
        sup.stop().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!sup.is_running());
        assert_eq!(sup.pid(), None);
        assert_eq!(sup.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let config = SupervisorConfig::default()
            .with_stop_timeout(Duration::from_millis(200))
            .with_restart_delay(Duration::from_millis(50));
        let sup = ProcessSupervisor::new(sh("trap '' TERM; exec sleep 30"), config);
        let pid = sup.start().await.unwrap();
        // Give the shell time to install the trap before exec.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        sup.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_forwarded_signal_triggers_restart() {
        let sup = ProcessSupervisor::new(vec!["sleep".into(), "30".into()], fast_config());
        let first = sup.start().await.unwrap();

        sup.forward_signal(Signal::SIGTERM).unwrap();
        let restarted = wait_until(
            || sup.pid().is_some_and(|p| p != first) && sup.is_running(),
            Duration::from_secs(5),
        )
        .await;
        assert!(restarted);

        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_signal_without_process() {
        let sup = ProcessSupervisor::new(vec!["true".into()], fast_config());
        sup.forward_signal(Signal::SIGHUP).unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let sup = ProcessSupervisor::new(vec!["sleep".into(), "30".into()], fast_config());
        sup.start().await.unwrap();
        sup.stop().await.unwrap();
        sup.start().await.unwrap();
        assert!(sup.is_running());
        sup.stop().await.unwrap();
    }
}
