//! Retention sweeper.
//!
//! Periodically deletes cache entries whose modification time is older than
//! the retention window. Reads refresh the modification time, so only entries
//! nobody asked for within the window are removed.
//!
//! The partial directory is swept with the same window. A running fetch keeps
//! writing to its partial file, so only leftovers of crashed fetches age out.

use crate::cache_key::StorageLayout;
use crate::cache_types::SweepReport;
use crate::config::RetentionConfig;
use crate::shutdown::ShutdownSignal;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

pub struct RetentionSweeper {
    layout: StorageLayout,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(layout: StorageLayout, retention: Duration, interval: Duration) -> Self {
        Self {
            layout,
            retention,
            interval,
        }
    }

    pub fn from_config(layout: StorageLayout, config: &RetentionConfig) -> Self {
        Self::new(layout, config.retention_window, config.sweep_interval)
    }

    /// Sweeps immediately, then every `interval` until shutdown.
    pub async fn run(self, mut shutdown_signal: ShutdownSignal) {
        info!(
            storage_dir = %self.layout.root().display(),
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting retention sweeper"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("Retention sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep_once().await;
                    log_sweep_report(&report);
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_at(SystemTime::now()).await
    }

    /// Runs one sweep treating `now` as the current time.
    pub async fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        self.sweep_directory(self.layout.root(), now, &mut report)
            .await;
        self.sweep_directory(&self.layout.partial_dir(), now, &mut report)
            .await;

        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    async fn sweep_directory(&self, dir: &Path, now: SystemTime, report: &mut SweepReport) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Directory {:?} does not exist, nothing to sweep", dir);
                return;
            }
            Err(e) => {
                warn!("Failed to list {:?}: {}", dir, e);
                report.failures += 1;
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to list {:?}: {}", dir, e);
                    report.failures += 1;
                    break;
                }
            };
            let path = entry.path();

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Deleted concurrently
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Failed to read metadata of {:?}: {}", path, e);
                    report.failures += 1;
                    continue;
                }
            };
            // Top-level only; the partial directory is handled separately
            if !metadata.is_file() {
                continue;
            }
            report.scanned += 1;

            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Failed to read modification time of {:?}: {}", path, e);
                    report.failures += 1;
                    continue;
                }
            };
            // Timestamps in the future count as fresh
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.retention {
                report.retained += 1;
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    match self.layout.key_for_path(&path) {
                        Some(key) => info!(
                            "Evicted cache entry {} (age {}s, {} bytes)",
                            key,
                            age.as_secs(),
                            metadata.len()
                        ),
                        None => info!(
                            "Deleted expired file: {:?} (age {}s, {} bytes)",
                            path,
                            age.as_secs(),
                            metadata.len()
                        ),
                    }
                    report.deleted += 1;
                    report.bytes_freed += metadata.len();
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete expired file {:?}: {}", path, e);
                    report.failures += 1;
                }
            }
        }
    }
}

fn log_sweep_report(report: &SweepReport) {
    if report.deleted > 0 || report.failures > 0 {
        info!(
            scanned = report.scanned,
            deleted = report.deleted,
            bytes_freed = report.bytes_freed,
            retained = report.retained,
            failures = report.failures,
            duration_ms = report.duration_ms,
            "Retention sweep complete"
        );
    } else {
        debug!(
            scanned = report.scanned,
            retained = report.retained,
            duration_ms = report.duration_ms,
            "Retention sweep found nothing to delete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn write_with_age(path: &Path, len: usize, age: Duration) {
        std::fs::write(path, vec![0u8; len]).unwrap();
        let mtime = SystemTime::now() - age;
        filetime::set_file_mtime(path, FileTime::from_system_time(mtime)).unwrap();
    }

    #[tokio::test]
    async fn test_missing_storage_dir_yields_empty_report() {
        let dir = TempDir::new().unwrap();
        let sweeper = RetentionSweeper::new(
            StorageLayout::new(dir.path().join("missing"), "mp4"),
            DAY,
            Duration::from_secs(3600),
        );

        let report = sweeper.sweep_once().await;
        assert_eq!(report.scanned, 0);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn test_boundary_age_is_retained() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("edge.mp4");
        std::fs::write(&path, b"data").unwrap();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        let sweeper = RetentionSweeper::new(
            StorageLayout::new(dir.path(), "mp4"),
            DAY,
            Duration::from_secs(3600),
        );

        let at_boundary = sweeper.sweep_at(modified + DAY).await;
        assert_eq!(at_boundary.retained, 1);
        assert!(path.exists());

        let past_boundary = sweeper
            .sweep_at(modified + DAY + Duration::from_secs(1))
            .await;
        assert_eq!(past_boundary.deleted, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_subdirectories_are_not_scanned_as_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".partial")).unwrap();
        std::fs::create_dir_all(dir.path().join("other")).unwrap();
        write_with_age(&dir.path().join("other").join("old.mp4"), 10, 3 * DAY);

        let sweeper = RetentionSweeper::new(
            StorageLayout::new(dir.path(), "mp4"),
            DAY,
            Duration::from_secs(3600),
        );
        let report = sweeper.sweep_once().await;

        assert_eq!(report.scanned, 0);
        assert!(dir.path().join("other").join("old.mp4").exists());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        write_with_age(&dir.path().join("stale.mp4"), 10, 2 * DAY);

        let sweeper = RetentionSweeper::new(
            StorageLayout::new(dir.path(), "mp4"),
            DAY,
            Duration::from_secs(3600),
        );
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(sweeper.run(ShutdownSignal::new(rx)));

        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!dir.path().join("stale.mp4").exists());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
