//! In-flight fetch tracker for download coalescing.
//!
//! This module provides the `InFlightTracker` which coordinates concurrent requests
//! for the same cache key, ensuring only one fetch runs while others wait.
//!
//! # Architecture
//!
//! When multiple requests arrive for the same uncached video:
//! 1. First request becomes the "Fetcher" and submits the download
//! 2. Subsequent requests become "Waiters" and subscribe to a broadcast channel
//! 3. When the download finishes, the Fetcher's guard removes the key and
//!    notifies all Waiters via the broadcast
//! 4. Waiters then serve the published file from disk
//!
//! The key is removed *before* the notification is sent. A request that
//! arrives between the two registers as a new Fetcher, and that fetch finds
//! the published file on its re-check instead of downloading again.

use crate::cache_key::CacheKey;
use crate::ProxyError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Result type for fetch completion notification.
/// `Ok(())` indicates the entry was published, `Err` carries the failure.
pub type FetchResult = Result<(), ProxyError>;

/// Channel capacity for broadcast sender.
/// Only needs to hold one message (the completion notification).
const BROADCAST_CHANNEL_CAPACITY: usize = 1;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tracks in-flight fetches to enable request coalescing.
///
/// Uses a `DashMap` for concurrent access from multiple Tokio tasks.
/// Each entry maps a cache key to a broadcast sender that notifies
/// waiters when the fetch completes.
pub struct InFlightTracker {
    pending: Arc<DashMap<CacheKey, broadcast::Sender<FetchResult>>>,
}

/// Role assigned to a request after registration.
pub enum FetchRole {
    /// First request for this key - responsible for running the fetch.
    Fetcher(FetchGuard),
    /// Subsequent request - should wait for the fetcher to complete.
    Waiter(broadcast::Receiver<FetchResult>),
}

/// RAII guard that removes the key entry on drop.
///
/// This ensures cleanup happens even if the fetch task panics or is cancelled.
pub struct FetchGuard {
    key: CacheKey,
    sender: broadcast::Sender<FetchResult>,
    pending: Arc<DashMap<CacheKey, broadcast::Sender<FetchResult>>>,
    completed: bool,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Attempts to register a request for the given key.
    ///
    /// # Returns
    ///
    /// - `FetchRole::Fetcher(guard)` if no fetch is active for the key.
    ///   The caller must eventually call `guard.complete_success()` or
    ///   `guard.complete_error()` (dropping the guard also releases the key).
    ///
    /// - `FetchRole::Waiter(receiver)` if another request is already fetching.
    pub fn try_register(&self, key: &CacheKey) -> FetchRole {
        // Entry API gives an atomic check-and-insert
        match self.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
                vacant.insert(tx.clone());

                FetchRole::Fetcher(FetchGuard {
                    key: key.clone(),
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    completed: false,
                })
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                FetchRole::Waiter(occupied.get().subscribe())
            }
        }
    }

    /// Returns true while a fetch for `key` is registered.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Returns the number of in-flight fetches currently being tracked.
    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }

    /// Waits until no fetch is registered or `limit` elapses.
    /// Returns true when the tracker drained.
    pub async fn wait_until_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !self.pending.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
        true
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchGuard {
    /// Subscribes to this fetch's completion notification.
    ///
    /// The fetcher itself uses this when it also wants to wait for the
    /// result (blocking mode), since it hands the guard to a worker task.
    pub fn subscribe(&self) -> broadcast::Receiver<FetchResult> {
        self.sender.subscribe()
    }

    /// Releases the key and broadcasts `Ok(())` to all waiters.
    pub fn complete_success(mut self) {
        self.completed = true;
        self.pending.remove(&self.key);
        // No receivers is fine
        let _ = self.sender.send(Ok(()));
    }

    /// Releases the key and broadcasts `Err(error)` to all waiters.
    pub fn complete_error(mut self, error: ProxyError) {
        self.completed = true;
        self.pending.remove(&self.key);
        let _ = self.sender.send(Err(error));
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for FetchGuard {
    /// Safety net cleanup for panics or cancellation.
    ///
    /// If the guard is dropped without completing, the key is released and
    /// the channel closes, which waiters observe as `RecvError::Closed`.
    fn drop(&mut self) {
        if !self.completed {
            self.pending.remove(&self.key);
        }
    }
}
