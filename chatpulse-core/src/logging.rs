//! Logging infrastructure for chatpulse
//!
//! Logs are written to `~/.local/state/chatpulse/chatpulse.log` following XDG standards.
//! Per-turn ingest events can be given their own level so a large batch
//! does not drown the rest of the log.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target of the per-turn ingest events
const INGEST_TARGET: &str = "chatpulse_core::ingest";

/// Initialize the logging system
///
/// Sets up tracing with:
/// - File output to XDG state directory
/// - Daily rotation, keeping `max_files` files
/// - Level from config (`level`, `ingest_level`) unless RUST_LOG is set
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();

    // Create log directory if it doesn't exist
    std::fs::create_dir_all(&log_dir)?;

    // Daily files, oldest pruned past max_files
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("chatpulse.log")
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log file: {}", e)))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // RUST_LOG wins over the config file
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(config)?,
    };

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        ingest_level = config.ingest_level.as_deref().unwrap_or(&config.level),
        max_files = config.max_files,
        database = %Config::database_path().display(),
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Filter directives for a logging config, e.g. `info,chatpulse_core::ingest=warn`
pub fn filter_directives(config: &LoggingConfig) -> String {
    match config.ingest_level.as_deref() {
        Some(ingest_level) if ingest_level != config.level => {
            format!("{},{}={}", config.level, INGEST_TARGET, ingest_level)
        }
        _ => config.level.clone(),
    }
}

/// Parse the config's directives, rejecting malformed levels.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = filter_directives(config);
    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("invalid log directives '{}': {}", directives, e)))
}

/// Initialize logging for tests (logs to stdout)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Returns the log file path
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}
