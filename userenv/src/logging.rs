//! Tracing subscriber setup for the server binary.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Prefix of the daily log files written under the log directory.
pub const LOG_FILE_PREFIX: &str = "userenv.log";

/// Keeps the background log writer alive. Hold it until exit.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber: an `EnvFilter` (from `RUST_LOG`, else
/// `info`), a stdout layer, and a daily rolling file under `log_dir` when
/// one is given.
pub fn init_logging(log_dir: Option<&Path>) -> io::Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_writer(io::stdout).with_target(true);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init()
            .map_err(io::Error::other)?;
        return Ok(LogGuard { _file: None });
    };

    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    Ok(LogGuard { _file: Some(guard) })
}
