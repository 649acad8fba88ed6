//! Logging initialization for the `rusty-jobs` binary.
//!
//! Protocol traffic is chatty at `debug`, so logs go to files under
//! `~/.rusty-jobs/logs/` instead of the terminal that prints job output.
//! Each run gets its own file.
//!
//! # Configuration
//!
//! The log level can be controlled via the `RUST_LOG` environment variable:
//! - `RUST_LOG=debug` - Show every request/response exchanged with the supervisor
//! - `RUST_LOG=info` - Session and job lifecycle (default)
//! - `RUST_LOG=warn` - Reconnects and anomalies only

use std::fs;
use std::path::PathBuf;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `~/.rusty-jobs/logs`, or `./logs` when there is no home directory.
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".rusty-jobs").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Initialize the logging system.
///
/// Creates `rusty-jobs.<timestamp>.log` in `log_dir` and installs a global
/// subscriber writing to it. The returned guard must be held until exit so
/// buffered lines get flushed. Returns `None` (and logs nothing) when the
/// file cannot be created.
pub fn init_logging(log_dir: PathBuf) -> Option<WorkerGuard> {
    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Failed to create logs directory: {}", e);
        return None;
    }

    // Format: rusty-jobs.2024-12-06-14-30-25.log
    let timestamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
    let log_path = log_dir.join(format!("rusty-jobs.{}.log", timestamp));

    let log_file = match fs::File::create(&log_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Warning: Failed to create log file: {}", e);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    // Default to "info" level if RUST_LOG is not set
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .init();

    tracing::info!("Logging initialized - writing to {}", log_path.display());
    Some(guard)
}
