//! Child process spawning for supervised commands.

use std::process::Stdio;

use tokio::process::{Child, Command};
use userenv_shared::errors::{UserEnvError, UserEnvResult};

/// What to launch: argv plus extra environment variables.
#[derive(Debug, Clone)]
pub(super) struct Launch {
    pub command: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl Launch {
    pub(super) fn validate(&self) -> UserEnvResult<()> {
        match self.command.first() {
            Some(program) if !program.is_empty() => Ok(()),
            _ => Err(UserEnvError::InvalidCommand("empty command".into())),
        }
    }
}

/// Spawns the supervised command with stdout/stderr bound to our own streams.
///
/// # Returns
/// * `Ok(Child)` - Successfully spawned process
/// * `Err(...)` - Empty argv or the OS refused to spawn
pub(super) fn spawn_process(launch: &Launch) -> UserEnvResult<Child> {
    launch.validate()?;
    let (program, args) = launch
        .command
        .split_first()
        .ok_or_else(|| UserEnvError::InvalidCommand("empty command".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.envs(launch.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    // The supervised process shares our stdout/stderr so its output lands in
    // the host's log stream; stdin is never read.
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);

    cmd.spawn().map_err(|e| {
        let err_msg = format!("Failed to spawn {}: {}", program, e);
        tracing::error!("{}", err_msg);
        UserEnvError::Spawn(err_msg)
    })
}
