//! Logging Module
//!
//! Application logging through `tracing`: a compact console layer and, when
//! enabled, a daily-rolling file under `{app_log_dir}/{hostname}/`.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "video-cache-proxy.log";

pub struct LoggerManager {
    config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Directory the rolling log files are written to
    pub fn host_log_dir(&self) -> PathBuf {
        self.config.app_log_dir.join(&self.hostname)
    }

    /// Install the global subscriber. A subscriber that is already installed
    /// (as in tests) is left in place.
    pub fn initialize(&self) -> Result<()> {
        let file_layer = if self.config.file_logging_enabled {
            let host_log_dir = self.host_log_dir();
            std::fs::create_dir_all(&host_log_dir).map_err(|e| {
                ProxyError::IoError(format!(
                    "Failed to create app log directory {:?}: {}",
                    host_log_dir, e
                ))
            })?;

            let file_appender =
                RollingFileAppender::new(Rotation::DAILY, host_log_dir, LOG_FILE_PREFIX);

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact(),
            )
        } else {
            None
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG wins over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(()) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if self.config.file_logging_enabled {
                    info!("Application logs will be written to: {:?}", self.host_log_dir());
                }
            }
            Err(_) => {
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }

    /// Remove application log files older than the configured retention.
    pub fn rotate_logs(&self) -> usize {
        let removed = cleanup_old_logs(&self.host_log_dir(), self.config.log_retention_days);
        if removed > 0 {
            info!("Removed {} application log files older than {} days", removed, self.config.log_retention_days);
        }
        removed
    }
}

/// Deletes regular files in `log_dir` not modified within `keep_days`.
/// Returns how many were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep_days: u32) -> usize {
    let cutoff_time = SystemTime::now() - Duration::from_secs(keep_days as u64 * 24 * 3600);
    let mut removed = 0;

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified < cutoff_time {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Removed old log file: {:?}", entry.path());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove old log file {:?}: {}", entry.path(), e),
            }
        }
    }

    removed
}
