//! Fetch Coordinator Module
//!
//! Decides, for each incoming identifier, whether to serve an existing entry,
//! join a fetch that is already running, or start a new one. Every fetch runs
//! on a bounded worker pool and publishes its output atomically:
//!
//! 1. The worker writes into `{storage}/.partial/{key}.{attempt}.{ext}`
//! 2. The output is verified to be non-empty
//! 3. The file is renamed to `{storage}/{key}.{ext}`
//!
//! Disk state is the only record of completed entries. The coordinator keeps
//! in memory only the in-flight registry and, for the poll surface, the cause
//! of the last failed attempt per key.

use crate::cache_key::{derive_key, CacheKey, StorageLayout};
use crate::cache_types::{
    CacheEntry, CoordinatorStats, PollOutcome, Readiness, StatsSnapshot, TriggerOutcome,
};
use crate::config::FetchConfig;
use crate::fetcher::ContentFetcher;
use crate::inflight_tracker::{FetchGuard, FetchResult, FetchRole, InFlightTracker};
use crate::{ProxyError, Result};
use dashmap::DashMap;
use filetime::FileTime;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tuning knobs for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub worker_pool_size: usize,
    pub fetch_timeout: Duration,
    pub wait_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            fetch_timeout: Duration::from_secs(30 * 60),
            wait_timeout: Duration::from_secs(35 * 60),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            worker_pool_size: config.worker_pool_size,
            fetch_timeout: config.fetch_timeout,
            wait_timeout: config.wait_timeout,
        }
    }
}

/// How a worker finished a fetch job successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    /// The external fetch ran and its output was published.
    Fetched { size: u64 },
    /// The entry was already on disk when the worker got a pool slot.
    AlreadyPresent,
}

pub struct FetchCoordinator<F: ContentFetcher> {
    layout: StorageLayout,
    fetcher: Arc<F>,
    inflight: Arc<InFlightTracker>,
    workers: Arc<Semaphore>,
    worker_limit: usize,
    fetch_timeout: Duration,
    wait_timeout: Duration,
    failures: Arc<DashMap<CacheKey, String>>,
    stats: Arc<CoordinatorStats>,
}

impl<F: ContentFetcher> FetchCoordinator<F> {
    pub fn new(layout: StorageLayout, fetcher: Arc<F>, settings: CoordinatorSettings) -> Self {
        let worker_limit = settings.worker_pool_size.max(1);
        Self {
            layout,
            fetcher,
            inflight: Arc::new(InFlightTracker::new()),
            workers: Arc::new(Semaphore::new(worker_limit)),
            worker_limit,
            fetch_timeout: settings.fetch_timeout,
            wait_timeout: settings.wait_timeout,
            failures: Arc::new(DashMap::new()),
            stats: Arc::new(CoordinatorStats::new()),
        }
    }

    /// Creates the storage and partial directories and removes partial files
    /// left behind by a previous process. Returns the number of files removed.
    ///
    /// Must run before any fetch is admitted: every file in the partial
    /// directory is assumed to be abandoned.
    pub async fn initialize(&self) -> Result<usize> {
        let partial_dir = self.layout.partial_dir();
        tokio::fs::create_dir_all(&partial_dir).await.map_err(|e| {
            ProxyError::StorageError(format!(
                "Failed to create storage directory {:?}: {}",
                partial_dir, e
            ))
        })?;

        let mut entries = tokio::fs::read_dir(&partial_dir).await.map_err(|e| {
            ProxyError::StorageError(format!("Failed to list {:?}: {}", partial_dir, e))
        })?;

        let mut removed = 0usize;
        let mut bytes = 0u64;
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ProxyError::StorageError(format!("Failed to list {:?}: {}", partial_dir, e))
        })? {
            let path = entry.path();
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    bytes += size;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove stale partial file {:?}: {}", path, e),
            }
        }

        if removed > 0 {
            info!(
                "Removed {} stale partial files ({} bytes) from {:?}",
                removed, bytes, partial_dir
            );
        }
        info!(
            "Fetch coordinator ready: storage={:?}, workers={}, fetch_timeout={:?}, wait_timeout={:?}",
            self.layout.root(),
            self.worker_limit,
            self.fetch_timeout,
            self.wait_timeout
        );
        Ok(removed)
    }

    /// Returns the published entry for `key`, refreshing its access time.
    ///
    /// Missing and zero-length files are reported as `None`.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.layout.entry_path(key);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProxyError::StorageError(format!(
                    "Failed to stat {:?}: {}",
                    path, e
                )))
            }
        };
        if !metadata.is_file() || metadata.len() == 0 {
            return Ok(None);
        }

        let now = SystemTime::now();
        let stamp = FileTime::from_system_time(now);
        match filetime::set_file_times(&path, stamp, stamp) {
            Ok(()) => {}
            // Swept between the stat and the touch
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => warn!("Failed to refresh access time of {:?}: {}", path, e),
        }

        Ok(Some(CacheEntry {
            key: key.clone(),
            path,
            size: metadata.len(),
            last_access: now,
        }))
    }

    /// Blocking surface: returns the entry for `identifier`, fetching it if
    /// needed and waiting for the fetch to finish.
    ///
    /// Concurrent callers for the same identifier share one fetch.
    pub async fn retrieve_blocking(&self, identifier: &str) -> Result<CacheEntry> {
        let key = derive_key(identifier);
        if let Some(entry) = self.lookup(&key).await? {
            self.stats.record_hit();
            debug!("Cache hit: key={}, size={}", key, entry.size);
            return Ok(entry);
        }
        self.stats.record_miss();

        let receiver = match self.inflight.try_register(&key) {
            FetchRole::Fetcher(guard) => {
                let receiver = guard.subscribe();
                debug!("Starting fetch: key={}, source={}", key, identifier);
                self.spawn_job(guard, identifier, false);
                receiver
            }
            FetchRole::Waiter(receiver) => {
                self.stats.record_join();
                debug!("Joining in-flight fetch: key={}", key);
                receiver
            }
        };

        self.await_completion(&key, receiver).await
    }

    async fn await_completion(
        &self,
        key: &CacheKey,
        mut receiver: broadcast::Receiver<FetchResult>,
    ) -> Result<CacheEntry> {
        let notification = match timeout(self.wait_timeout, receiver.recv()).await {
            Ok(notification) => notification,
            Err(_) => {
                warn!(
                    "Gave up waiting for fetch after {:?}: key={}",
                    self.wait_timeout, key
                );
                return Err(ProxyError::LockTimeout(format!(
                    "fetch for {} did not finish within {:?}",
                    key, self.wait_timeout
                )));
            }
        };

        match notification {
            Ok(Ok(())) => self.lookup(key).await?.ok_or_else(|| {
                ProxyError::FetchError(format!("entry {} vanished after publish", key))
            }),
            Ok(Err(e)) => Err(e),
            // The worker task ended without reporting (panic or runtime shutdown)
            Err(_) => self.lookup(key).await?.ok_or_else(|| {
                ProxyError::FetchError(format!("fetch for {} ended without a result", key))
            }),
        }
    }

    /// Non-blocking readiness check for the poll surface.
    ///
    /// A recorded failure is returned once and then forgotten.
    pub async fn check_ready(&self, identifier: &str) -> Result<Readiness> {
        let key = derive_key(identifier);
        if let Some(entry) = self.lookup(&key).await? {
            return Ok(Readiness::Ready(entry));
        }
        if self.inflight.is_in_flight(&key) {
            return Ok(Readiness::NotReady);
        }
        if let Some((_, cause)) = self.failures.remove(&key) {
            return Ok(Readiness::Failed { cause });
        }
        Ok(Readiness::NotReady)
    }

    /// Starts a background fetch unless one is already active for the key.
    pub fn trigger_fetch(&self, identifier: &str) -> TriggerOutcome {
        let key = derive_key(identifier);
        match self.inflight.try_register(&key) {
            FetchRole::Fetcher(guard) => {
                info!("Triggered background fetch: key={}, source={}", key, identifier);
                self.spawn_job(guard, identifier, true);
                TriggerOutcome::Started
            }
            FetchRole::Waiter(_) => TriggerOutcome::AlreadyActive,
        }
    }

    /// Poll surface: check readiness, trigger a fetch when not ready.
    pub async fn poll(&self, identifier: &str) -> Result<PollOutcome> {
        match self.check_ready(identifier).await? {
            Readiness::Ready(entry) => {
                self.stats.record_hit();
                Ok(PollOutcome::Ready(entry))
            }
            Readiness::Failed { cause } => Ok(PollOutcome::Failed { cause }),
            Readiness::NotReady => {
                self.stats.record_miss();
                let newly_triggered = match self.trigger_fetch(identifier) {
                    TriggerOutcome::Started => true,
                    TriggerOutcome::AlreadyActive => {
                        self.stats.record_join();
                        false
                    }
                };
                Ok(PollOutcome::Accepted { newly_triggered })
            }
        }
    }

    fn spawn_job(&self, guard: FetchGuard, identifier: &str, record_failure: bool) {
        let job = FetchJob {
            guard,
            source: identifier.to_string(),
            layout: self.layout.clone(),
            fetcher: Arc::clone(&self.fetcher),
            workers: Arc::clone(&self.workers),
            failures: Arc::clone(&self.failures),
            stats: Arc::clone(&self.stats),
            fetch_timeout: self.fetch_timeout,
            record_failure,
        };
        tokio::spawn(job.run());
    }

    /// Waits until no fetch is in flight or `limit` elapses.
    /// Returns true when everything finished.
    pub async fn drain(&self, limit: Duration) -> bool {
        let drained = self.inflight.wait_until_idle(limit).await;
        if !drained {
            warn!(
                "Drain timed out with {} fetches in flight",
                self.inflight.in_flight_count()
            );
        }
        drained
    }

    /// Shared handle to the in-flight registry, for shutdown draining.
    pub fn inflight_tracker(&self) -> Arc<InFlightTracker> {
        Arc::clone(&self.inflight)
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.in_flight_count()
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit
    }
}

/// One admitted fetch, executed on the worker pool.
struct FetchJob<F: ContentFetcher> {
    guard: FetchGuard,
    source: String,
    layout: StorageLayout,
    fetcher: Arc<F>,
    workers: Arc<Semaphore>,
    failures: Arc<DashMap<CacheKey, String>>,
    stats: Arc<CoordinatorStats>,
    fetch_timeout: Duration,
    record_failure: bool,
}

impl<F: ContentFetcher> FetchJob<F> {
    async fn run(self) {
        let FetchJob {
            guard,
            source,
            layout,
            fetcher,
            workers,
            failures,
            stats,
            fetch_timeout,
            record_failure,
        } = self;
        let key = guard.key().clone();

        let _permit = match workers.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("Worker pool closed, abandoning fetch: key={}", key);
                guard.complete_error(ProxyError::InternalError(
                    "worker pool closed".to_string(),
                ));
                return;
            }
        };

        let started = Instant::now();
        let outcome = execute(&layout, fetcher.as_ref(), &stats, &key, &source, fetch_timeout).await;

        match outcome {
            Ok(JobOutcome::Fetched { size }) => {
                failures.remove(&key);
                stats.record_fetch_succeeded();
                info!(
                    "Fetch published: key={}, size={} bytes, elapsed={:?}",
                    key,
                    size,
                    started.elapsed()
                );
                guard.complete_success();
            }
            Ok(JobOutcome::AlreadyPresent) => {
                failures.remove(&key);
                debug!("Entry already published, skipping fetch: key={}", key);
                guard.complete_success();
            }
            Err(e) => {
                stats.record_fetch_failed();
                error!("Fetch failed: key={}, source={}, error={}", key, source, e);
                if record_failure {
                    failures.insert(key, e.to_string());
                }
                guard.complete_error(e);
            }
        }
    }
}

async fn execute<F: ContentFetcher>(
    layout: &StorageLayout,
    fetcher: &F,
    stats: &CoordinatorStats,
    key: &CacheKey,
    source: &str,
    fetch_timeout: Duration,
) -> Result<JobOutcome> {
    let entry_path = layout.entry_path(key);
    if is_published(&entry_path).await {
        return Ok(JobOutcome::AlreadyPresent);
    }

    let partial_dir = layout.partial_dir();
    tokio::fs::create_dir_all(&partial_dir).await.map_err(|e| {
        ProxyError::StorageError(format!("Failed to create {:?}: {}", partial_dir, e))
    })?;

    let attempt = Uuid::new_v4().simple().to_string();
    let partial_path = layout.partial_path(key, &attempt);
    stats.record_fetch_started();

    let result = match timeout(fetch_timeout, fetcher.fetch(source, &partial_path)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::FetchError(format!(
            "fetch exceeded its deadline of {:?}",
            fetch_timeout
        ))),
    };

    let result = match result {
        Ok(()) => publish(&partial_path, &entry_path).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(size) => Ok(JobOutcome::Fetched { size }),
        Err(e) => {
            remove_attempt_files(&partial_dir, &StorageLayout::partial_prefix(key, &attempt))
                .await;
            Err(e)
        }
    }
}

async fn is_published(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && metadata.len() > 0,
        Err(_) => false,
    }
}

/// Verifies the fetch output and renames it into place.
async fn publish(partial_path: &Path, entry_path: &Path) -> Result<u64> {
    let size = match tokio::fs::metadata(partial_path).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        Ok(_) => {
            return Err(ProxyError::FetchError(
                "fetch output is not a regular file".to_string(),
            ))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ProxyError::FetchError("fetch produced no output".to_string()))
        }
        Err(e) => {
            return Err(ProxyError::StorageError(format!(
                "Failed to stat {:?}: {}",
                partial_path, e
            )))
        }
    };
    if size == 0 {
        return Err(ProxyError::FetchError(
            "fetch produced an empty file".to_string(),
        ));
    }

    // Downloaders may stamp the file with the upstream modification time;
    // the entry must be fresh from the moment it becomes visible
    let now = FileTime::from_system_time(SystemTime::now());
    if let Err(e) = filetime::set_file_times(partial_path, now, now) {
        warn!("Failed to stamp fetch output {:?}: {}", partial_path, e);
    }

    tokio::fs::rename(partial_path, entry_path)
        .await
        .map_err(|e| {
            ProxyError::StorageError(format!(
                "Failed to publish {:?} to {:?}: {}",
                partial_path, entry_path, e
            ))
        })?;

    Ok(size)
}

/// Removes every file a failed attempt left in the partial directory.
async fn remove_attempt_files(partial_dir: &Path, prefix: &str) {
    let mut entries = match tokio::fs::read_dir(partial_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to list {:?} for cleanup: {}", partial_dir, e);
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to list {:?} for cleanup: {}", partial_dir, e);
                break;
            }
        };
        let matches = entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(prefix))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed partial output {:?}", path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial output {:?}: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    enum Behavior {
        Write(usize),
        WriteEmpty,
        Fail,
        Hang,
    }

    struct MockFetcher {
        calls: AtomicUsize,
        behavior: Behavior,
    }

    impl MockFetcher {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behavior,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ContentFetcher for MockFetcher {
        async fn fetch(&self, _source: &str, destination: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Write(len) => {
                    tokio::fs::write(destination, vec![7u8; len]).await?;
                    Ok(())
                }
                Behavior::WriteEmpty => {
                    tokio::fs::write(destination, b"").await?;
                    Ok(())
                }
                Behavior::Fail => {
                    tokio::fs::write(destination, b"partial").await?;
                    Err(ProxyError::FetchError("exit status 1".to_string()))
                }
                Behavior::Hang => {
                    tokio::fs::write(destination, b"partial").await?;
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    fn coordinator(
        dir: &TempDir,
        fetcher: Arc<MockFetcher>,
        fetch_timeout: Duration,
    ) -> FetchCoordinator<MockFetcher> {
        FetchCoordinator::new(
            StorageLayout::new(dir.path(), "mp4"),
            fetcher,
            CoordinatorSettings {
                worker_pool_size: 2,
                fetch_timeout,
                wait_timeout: Duration::from_secs(10),
            },
        )
    }

    fn partial_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path().join(".partial"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_initialize_creates_dirs_and_removes_stale_partials() {
        let dir = TempDir::new().unwrap();
        let partial_dir = dir.path().join(".partial");
        std::fs::create_dir_all(&partial_dir).unwrap();
        std::fs::write(partial_dir.join("stale.1.mp4"), b"junk").unwrap();

        let coordinator = coordinator(&dir, MockFetcher::new(Behavior::Write(10)), Duration::from_secs(5));
        let removed = coordinator.initialize().await.unwrap();

        assert_eq!(removed, 1);
        assert!(partial_dir.is_dir());
        assert_eq!(partial_files(&dir), 0);
    }

    #[tokio::test]
    async fn test_lookup_ignores_zero_length_file() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, MockFetcher::new(Behavior::Write(10)), Duration::from_secs(5));
        let key = derive_key("https://www.youtube.com/watch?v=empty");
        std::fs::write(coordinator.layout().entry_path(&key), b"").unwrap();

        assert!(coordinator.lookup(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_refreshes_mtime() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, MockFetcher::new(Behavior::Write(10)), Duration::from_secs(5));
        let key = derive_key("https://www.youtube.com/watch?v=old");
        let path = coordinator.layout().entry_path(&key);
        std::fs::write(&path, b"video").unwrap();

        let old = SystemTime::now() - Duration::from_secs(48 * 3600);
        filetime::set_file_mtime(&path, FileTime::from_system_time(old)).unwrap();

        let entry = coordinator.lookup(&key).await.unwrap().unwrap();
        assert_eq!(entry.size, 5);

        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        assert!(age < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_blocking_failure_leaves_no_files() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new(Behavior::Fail);
        let coordinator = coordinator(&dir, fetcher.clone(), Duration::from_secs(5));
        coordinator.initialize().await.unwrap();

        let identifier = "https://www.youtube.com/watch?v=broken";
        let result = coordinator.retrieve_blocking(identifier).await;

        assert!(matches!(result, Err(ProxyError::FetchError(_))));
        assert!(!coordinator.layout().entry_path(&derive_key(identifier)).exists());
        assert_eq!(partial_files(&dir), 0);
        assert_eq!(coordinator.in_flight_count(), 0);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_output_is_fetch_error() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, MockFetcher::new(Behavior::WriteEmpty), Duration::from_secs(5));

        let result = coordinator
            .retrieve_blocking("https://www.youtube.com/watch?v=nothing")
            .await;

        match result {
            Err(ProxyError::FetchError(cause)) => assert!(cause.contains("empty")),
            other => panic!("Expected FetchError, got {:?}", other),
        }
        assert_eq!(partial_files(&dir), 0);
    }

    #[tokio::test]
    async fn test_fetch_deadline_cancels_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, MockFetcher::new(Behavior::Hang), Duration::from_millis(200));

        let result = coordinator
            .retrieve_blocking("https://www.youtube.com/watch?v=slow")
            .await;

        match result {
            Err(ProxyError::FetchError(cause)) => assert!(cause.contains("deadline")),
            other => panic!("Expected FetchError, got {:?}", other),
        }
        assert_eq!(partial_files(&dir), 0);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_skips_fetch_when_entry_appears() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new(Behavior::Write(10));
        let coordinator = coordinator(&dir, fetcher.clone(), Duration::from_secs(5));
        let identifier = "https://www.youtube.com/watch?v=present";
        let key = derive_key(identifier);

        // Register as fetcher directly, publish behind the coordinator's back,
        // then hand the guard to a worker.
        let guard = match coordinator.inflight.try_register(&key) {
            FetchRole::Fetcher(guard) => guard,
            FetchRole::Waiter(_) => panic!("Expected Fetcher"),
        };
        std::fs::write(coordinator.layout().entry_path(&key), b"already here").unwrap();
        let receiver = guard.subscribe();
        coordinator.spawn_job(guard, identifier, false);

        let entry = coordinator.await_completion(&key, receiver).await.unwrap();
        assert_eq!(entry.size, 12);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_waiter_times_out_with_lock_timeout() {
        let dir = TempDir::new().unwrap();
        let coordinator = FetchCoordinator::new(
            StorageLayout::new(dir.path(), "mp4"),
            MockFetcher::new(Behavior::Hang),
            CoordinatorSettings {
                worker_pool_size: 1,
                fetch_timeout: Duration::from_secs(60),
                wait_timeout: Duration::from_millis(100),
            },
        );

        let result = coordinator
            .retrieve_blocking("https://www.youtube.com/watch?v=wait")
            .await;

        assert!(matches!(result, Err(ProxyError::LockTimeout(_))));
        // The fetch itself keeps running
        assert_eq!(coordinator.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn test_poll_reports_failure_once_then_retriggers() {
        let dir = TempDir::new().unwrap();
        let fetcher = MockFetcher::new(Behavior::Fail);
        let coordinator = coordinator(&dir, fetcher.clone(), Duration::from_secs(5));
        let identifier = "https://www.youtube.com/watch?v=flaky";

        let first = coordinator.poll(identifier).await.unwrap();
        assert_eq!(first, PollOutcome::Accepted { newly_triggered: true });

        assert!(coordinator.drain(Duration::from_secs(5)).await);

        match coordinator.poll(identifier).await.unwrap() {
            PollOutcome::Failed { cause } => assert!(cause.contains("exit status 1")),
            other => panic!("Expected Failed, got {:?}", other),
        }

        let third = coordinator.poll(identifier).await.unwrap();
        assert_eq!(third, PollOutcome::Accepted { newly_triggered: true });
        assert!(coordinator.drain(Duration::from_secs(5)).await);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_blocking_failure_is_not_recorded_for_polling() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, MockFetcher::new(Behavior::Fail), Duration::from_secs(5));
        let identifier = "https://www.youtube.com/watch?v=blockfail";

        let _ = coordinator.retrieve_blocking(identifier).await;

        assert_eq!(
            coordinator.check_ready(identifier).await.unwrap(),
            Readiness::NotReady
        );
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, MockFetcher::new(Behavior::Write(100)), Duration::from_secs(5));
        let identifier = "https://www.youtube.com/watch?v=stats";

        coordinator.retrieve_blocking(identifier).await.unwrap();
        coordinator.retrieve_blocking(identifier).await.unwrap();

        let stats = coordinator.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.fetches_started, 1);
        assert_eq!(stats.fetches_succeeded, 1);
        assert_eq!(stats.fetches_failed, 0);
    }

    #[tokio::test]
    async fn test_publish_replaces_upstream_mtime() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path(), "mp4");
        let key = derive_key("https://www.youtube.com/watch?v=upstream-mtime");
        std::fs::create_dir_all(layout.partial_dir()).unwrap();

        // Output carrying the upload date of the video
        let partial = layout.partial_path(&key, "attempt");
        std::fs::write(&partial, b"video").unwrap();
        let upload_date = SystemTime::now() - Duration::from_secs(400 * 24 * 3600);
        filetime::set_file_mtime(&partial, FileTime::from_system_time(upload_date)).unwrap();

        let entry_path = layout.entry_path(&key);
        assert_eq!(publish(&partial, &entry_path).await.unwrap(), 5);

        let modified = std::fs::metadata(&entry_path).unwrap().modified().unwrap();
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        assert!(age < Duration::from_secs(60), "published entry is {:?} old", age);
        assert!(!partial.exists());
    }
}
