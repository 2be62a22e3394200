//! userenv server: supervises one process and serves the admin API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::Signal;
use tokio::net::TcpListener;
use tokio::signal::unix::{Signal as SignalStream, SignalKind, signal};

use userenv::components::{
    ComponentRegistry, DEFAULT_JUICEFS_BIN, DbComponent, FilesystemComponent, LeaserComponent,
    StackComponent,
};
use userenv::control::{self, Control, ControlSettings, SystemConfig};
use userenv::logging::init_logging;
use userenv::replication::{DEFAULT_LITESTREAM_BIN, litestream_factory};
use userenv::storage::DEFAULT_ENV_DIR;
use userenv::supervisor::{ProcessSupervisor, SupervisorConfig};

/// Control plane for a single-tenant, S3-backed sandbox environment
#[derive(Parser, Debug)]
#[command(name = "userenv", version)]
struct Cli {
    /// Address the admin API listens on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Host header the admin API answers to
    #[arg(long, default_value = "fly-app-controller")]
    admin_host: String,

    /// Bearer token required on admin requests
    #[arg(long, env = "CONTROLLER_TOKEN", hide_env_values = true)]
    token: String,

    /// Environment directory (holds config.json and component state)
    #[arg(long, default_value = DEFAULT_ENV_DIR)]
    env_dir: PathBuf,

    /// Also write daily rolling logs here
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Seconds to wait after SIGTERM before killing the process
    #[arg(long, default_value_t = 90)]
    stop_timeout: u64,

    /// Seconds to wait before restarting a crashed process
    #[arg(long, default_value_t = 1)]
    restart_delay: u64,

    /// Database file of the `db` component
    #[arg(long, env = "DB_PATH")]
    db_path: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_LITESTREAM_BIN)]
    litestream_bin: PathBuf,

    #[arg(long, default_value = DEFAULT_JUICEFS_BIN)]
    juicefs_bin: PathBuf,

    /// Ignore FLY_STORAGE_* variables and wait for a configuration POST
    #[arg(long, env = "FLY_ENV_WAIT_FOR_CONFIG")]
    wait_for_config: bool,

    /// Command to supervise
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

struct Signals {
    interrupt: SignalStream,
    terminate: SignalStream,
    hangup: SignalStream,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate())
                .context("failed to install SIGTERM handler")?,
            hangup: signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?,
        })
    }

    /// Forwards SIGHUP to the supervised process and returns on SIGINT or
    /// SIGTERM. Those two reach the process through the supervisor's stop.
    async fn wait_for_shutdown(mut self, supervisor: Arc<ProcessSupervisor>) {
        loop {
            let received = tokio::select! {
                _ = self.interrupt.recv() => Signal::SIGINT,
                _ = self.terminate.recv() => Signal::SIGTERM,
                _ = self.hangup.recv() => Signal::SIGHUP,
            };
            tracing::info!(signal = ?received, "Received signal");

            if received != Signal::SIGHUP {
                return;
            }
            if let Err(e) = supervisor.forward_signal(received) {
                tracing::warn!(error = %e, "Failed to forward signal");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_deref()).context("failed to initialise logging")?;

    let supervisor = Arc::new(ProcessSupervisor::new(
        cli.command.clone(),
        SupervisorConfig::default()
            .with_stop_timeout(Duration::from_secs(cli.stop_timeout))
            .with_restart_delay(Duration::from_secs(cli.restart_delay)),
    ));

    let replicators = litestream_factory(&cli.litestream_bin);
    let registry = ComponentRegistry::new(vec![
        Arc::new(LeaserComponent::default()) as Arc<dyn StackComponent>,
        Arc::new(DbComponent::new(cli.db_path.clone(), replicators.clone())),
        Arc::new(FilesystemComponent::new(&cli.juicefs_bin, replicators)),
    ]);

    let control = Arc::new(Control::new(
        ControlSettings {
            admin_host: cli.admin_host.clone(),
            token: cli.token.clone(),
            env_dir: cli.env_dir.clone(),
        },
        registry,
        Some(Arc::clone(&supervisor)),
    ));

    let from_env = if cli.wait_for_config {
        None
    } else {
        SystemConfig::from_env_vars(|name| std::env::var(name).ok())
    };
    // Conflicts are decided before the listener accepts requests.
    let startup = control
        .resolve_startup(from_env)
        .await
        .context("failed to read startup configuration")?;

    let signals = Signals::install()?;
    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    tracing::info!(
        listen = %cli.listen,
        admin_host = %cli.admin_host,
        command = ?cli.command,
        "Admin API listening"
    );

    let bootstrap = startup.map(|config| {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            if let Err(e) = control.apply_startup(config).await {
                tracing::error!(error = %e, "Startup configuration failed");
            }
        })
    });

    axum::serve(listener, control::router(Arc::clone(&control)))
        .with_graceful_shutdown(signals.wait_for_shutdown(Arc::clone(&supervisor)))
        .await
        .context("admin server failed")?;

    if let Some(bootstrap) = bootstrap {
        bootstrap.abort();
    }
    control.shutdown().await;
    Ok(())
}
