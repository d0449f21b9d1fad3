//! Cache key derivation and on-disk layout.
//!
//! A cache key is the BLAKE3 digest of the full source identifier (the
//! upstream URL), rendered as 64 lowercase hex characters. Keys are a pure
//! function of the identifier, so they survive restarts and never depend on
//! process state.
//!
//! # Storage Layout
//!
//! | Artifact | Path |
//! |---|---|
//! | Published entry | `{storage_dir}/{key}.{ext}` |
//! | Fetch in progress | `{storage_dir}/.partial/{key}.{attempt}.{ext}` |
//!
//! The partial directory lives inside the storage directory so the final
//! rename stays on one filesystem and is atomic.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Name of the subdirectory holding artifacts of fetches that have not been published.
pub const PARTIAL_DIR_NAME: &str = ".partial";

/// Length of a rendered cache key (256-bit digest as hex).
pub const CACHE_KEY_LEN: usize = 64;

/// Stable identifier derived from a request's source identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Returns the key as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses a previously rendered key, rejecting anything that is not
    /// exactly 64 lowercase hex characters.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == CACHE_KEY_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| CacheKey(value.to_string()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the cache key for a source identifier.
pub fn derive_key(identifier: &str) -> CacheKey {
    CacheKey(blake3::hash(identifier.as_bytes()).to_hex().to_string())
}

/// Path convention shared by the fetch coordinator and the retention sweeper.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    extension: String,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of a published entry.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.{}", key, self.extension))
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.root.join(PARTIAL_DIR_NAME)
    }

    /// Location a single fetch attempt writes to before publishing.
    pub fn partial_path(&self, key: &CacheKey, attempt: &str) -> PathBuf {
        self.partial_dir()
            .join(format!("{}.{}.{}", key, attempt, self.extension))
    }

    /// File name prefix shared by everything a fetch attempt may leave behind
    /// (the downloader can create side files next to its output).
    pub fn partial_prefix(key: &CacheKey, attempt: &str) -> String {
        format!("{}.{}", key, attempt)
    }

    /// Recovers the cache key from a published entry path, if the file follows
    /// the naming convention.
    pub fn key_for_path(&self, path: &Path) -> Option<CacheKey> {
        let extension = path.extension()?.to_str()?;
        if extension != self.extension {
            return None;
        }
        CacheKey::parse(path.file_stem()?.to_str()?)
    }
}
