//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use video_cache_proxy::cache_key::StorageLayout;
use video_cache_proxy::coordinator::{CoordinatorSettings, FetchCoordinator};
use video_cache_proxy::fetcher::ContentFetcher;
use video_cache_proxy::{ProxyError, Result};

/// Fetcher that writes a fixed payload, optionally after a delay and after
/// failing a number of attempts first.
pub struct ScriptedFetcher {
    payload: Vec<u8>,
    delay: Duration,
    failures_remaining: AtomicUsize,
    hang: bool,
    calls: AtomicUsize,
    sources: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn writing(payload: Vec<u8>) -> Self {
        Self {
            payload,
            delay: Duration::ZERO,
            failures_remaining: AtomicUsize::new(0),
            hang: false,
            calls: AtomicUsize::new(0),
            sources: Mutex::new(Vec::new()),
        }
    }

    pub fn hanging() -> Self {
        let mut fetcher = Self::writing(Vec::new());
        fetcher.hang = true;
        fetcher
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(self, attempts: usize) -> Self {
        self.failures_remaining.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sources(&self) -> Vec<String> {
        self.sources.lock().unwrap().clone()
    }
}

impl ContentFetcher for ScriptedFetcher {
    async fn fetch(&self, source: &str, destination: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().unwrap().push(source.to_string());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.hang {
            std::future::pending::<()>().await;
        }

        let fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            // Leave a truncated artifact behind, as a crashed downloader would
            tokio::fs::write(destination, b"partial").await?;
            return Err(ProxyError::FetchError("simulated download failure".to_string()));
        }

        tokio::fs::write(destination, &self.payload).await?;
        Ok(())
    }
}

pub fn settings(wait_timeout: Duration, fetch_timeout: Duration) -> CoordinatorSettings {
    CoordinatorSettings {
        worker_pool_size: 4,
        fetch_timeout,
        wait_timeout,
    }
}

pub async fn coordinator(
    storage_dir: &Path,
    fetcher: Arc<ScriptedFetcher>,
    settings: CoordinatorSettings,
) -> Arc<FetchCoordinator<ScriptedFetcher>> {
    let layout = StorageLayout::new(storage_dir, "mp4");
    let coordinator = Arc::new(FetchCoordinator::new(layout, fetcher, settings));
    coordinator.initialize().await.unwrap();
    coordinator
}

pub fn partial_files(storage_dir: &Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(storage_dir.join(".partial")) {
        Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}
