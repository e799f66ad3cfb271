//! Structured logging setup. `tracing` + `EnvFilter` driven by `RUST_LOG`, with a non-blocking
//! rolling file appender writing to the process's log path — grounded on `beach-road/src/main.rs`'s
//! `tracing_subscriber::fmt::init()` plus its `RUST_LOG` default-when-unset dance, extended with
//! `tracing-appender` the way its sibling `beach-manager` app depends on it.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. The returned [`WorkerGuard`] must be kept alive for the
/// lifetime of the process — dropping it flushes and stops the background writer thread.
pub fn init(log_path: &Path, default_level: &str) -> anyhow::Result<WorkerGuard> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", default_level);
    }

    let dir = log_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "anava-connector.log".to_string());

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    Ok(guard)
}
