//! Cache Types Module
//!
//! Data types shared by the fetch coordinator, the retention sweeper and the
//! transport layer.

use crate::cache_key::CacheKey;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// A published artifact on disk.
///
/// Nothing about completed entries is kept in memory; this is a snapshot of
/// the file taken when it was looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    /// Byte length of the artifact (always non-zero).
    pub size: u64,
    /// Access timestamp written by the lookup that produced this entry.
    pub last_access: SystemTime,
}

/// Result of a non-blocking readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready(CacheEntry),
    NotReady,
    /// The most recent fetch for this key failed. Reported once; the record
    /// is cleared so the next poll starts a fresh attempt.
    Failed { cause: String },
}

/// Result of asking the coordinator to start a background fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new fetch was admitted to the worker pool.
    Started,
    /// A fetch for this key was already active; nothing was done.
    AlreadyActive,
}

/// Result of the poll surface: check readiness, trigger when not ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ready(CacheEntry),
    Accepted { newly_triggered: bool },
    Failed { cause: String },
}

/// Summary of one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Files examined (published entries and partials)
    pub scanned: usize,
    /// Files deleted because they exceeded the retention window
    pub deleted: usize,
    /// Total bytes reclaimed by deletions
    pub bytes_freed: u64,
    /// Files younger than the retention window
    pub retained: usize,
    /// Files that could not be inspected or deleted
    pub failures: usize,
    /// Duration of the sweep in milliseconds
    pub duration_ms: u64,
}

/// Lock-free counters maintained by the fetch coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fetches_started: AtomicU64,
    fetches_succeeded: AtomicU64,
    fetches_failed: AtomicU64,
    joined_in_flight: AtomicU64,
}

/// Point-in-time copy of [`CoordinatorStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fetches_started: u64,
    pub fetches_succeeded: u64,
    pub fetches_failed: u64,
    pub joined_in_flight: u64,
}

impl CoordinatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_started(&self) {
        self.fetches_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_succeeded(&self) {
        self.fetches_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failed(&self) {
        self.fetches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_join(&self) {
        self.joined_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            fetches_succeeded: self.fetches_succeeded.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            joined_in_flight: self.joined_in_flight.load(Ordering::Relaxed),
        }
    }
}
