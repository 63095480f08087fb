//! Tracing setup for Tidestream
//!
//! Console output follows the level the user asked for. When a log directory is
//! given, a second layer records every event at trace level, which is where the
//! per-poll availability checks and engine commands of a stream end up.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the trace log written inside the log directory.
pub const LOG_FILE_NAME: &str = "tidestream-last-run.log";

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides `console_level` for the console layer. With `logs_dir`
/// set, the previous run's log file is overwritten and its path returned.
///
/// # Errors
///
/// - `std::io::Error` - If the log directory or log file cannot be created
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<Option<PathBuf>, std::io::Error> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let Some(logs_dir) = logs_dir else {
        tracing_subscriber::registry().with(console_layer).init();
        return Ok(None);
    };

    create_dir_all(logs_dir)?;
    let log_file_path = logs_dir.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!(
        "Tracing initialized: console={}, trace_file={}",
        console_level,
        log_file_path.display()
    );

    Ok(Some(log_file_path))
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warnings, including read timeouts
    Warn,
    /// Stream open/close and buffering summaries
    Info,
    /// Window updates and buffer refills
    Debug,
    /// Every availability poll
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Level::from(*self).fmt(f)
    }
}
