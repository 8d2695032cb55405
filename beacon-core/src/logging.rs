//! Logging for beacon
//!
//! Logs go to the XDG state directory (`~/.local/state/beacon/`) and roll
//! over daily. The file for a given day is `beacon.log.YYYY-MM-DD` (UTC).
//! Queue and transport events carry structured fields such as `task_id`,
//! `request_id` and `event_name`, so the files grep well.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

/// Prefix of every log file; the appender appends `.YYYY-MM-DD`
pub const LOG_FILE_PREFIX: &str = "beacon.log";

/// Install the global subscriber writing to the state directory.
///
/// `RUST_LOG` overrides `logging.level`. Fails if a subscriber is already
/// installed.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    let (writer, guard) = file_writer(&log_dir, config.max_files)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install subscriber: {}", e)))?;

    tracing::info!(
        log_file = %current_log_file().display(),
        level = %config.level,
        "Logging initialized"
    );

    Ok(LoggingGuard { _worker: guard })
}

fn file_writer(log_dir: &Path, max_files: usize) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(max_files.max(1))
        .build(log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Route logs to the test harness; `beacon_core` debug output by default
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("beacon_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Flushes buffered log lines when dropped; keep it alive for the process
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Log file the daily appender writes to on `date`
pub fn log_file_for(log_dir: &Path, date: NaiveDate) -> PathBuf {
    log_dir.join(format!("{}.{}", LOG_FILE_PREFIX, date.format("%Y-%m-%d")))
}

/// Log file being written today
pub fn current_log_file() -> PathBuf {
    log_file_for(&Config::state_dir(), Utc::now().date_naive())
}
