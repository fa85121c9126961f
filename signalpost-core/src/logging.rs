//! Logging infrastructure for signalpost
//!
//! Logs go to daily files named `signalpost.log.YYYY-MM-DD` in the XDG
//! state directory (`~/.local/state/signalpost/`). Signal delivery never
//! blocks on log I/O.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

/// File name prefix for rotated log files
pub const LOG_FILE_PREFIX: &str = "signalpost.log";

/// Install the global file logger
///
/// `RUST_LOG` takes precedence over the configured level. Keep the returned
/// guard alive for as long as logs should be written.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    let (writer, guard) = tracing_appender::non_blocking(file_appender(&log_dir, config.max_files)?);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(log_dir = %log_dir.display(), level = %config.level, "Logging initialized");

    Ok(LoggingGuard {
        log_dir,
        _guard: guard,
    })
}

/// Daily-rotating appender in `dir`, keeping at most `max_files` files
fn file_appender(dir: &Path, max_files: usize) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(|e| Error::Config(format!("failed to create log file: {}", e)))
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Route logs to the test harness's captured output
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the background log writer running
///
/// Dropping it flushes pending lines.
pub struct LoggingGuard {
    log_dir: PathBuf,
    _guard: WorkerGuard,
}

impl LoggingGuard {
    /// Directory the log files are written to
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}
