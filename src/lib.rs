//! Video Cache Proxy - caching HTTP front for remote videos
//!
//! Requests name a remote video by path; the first request for a video runs
//! an external downloader into a partial file and publishes it atomically,
//! later requests are served from disk until the retention sweeper ages the
//! file out.

pub mod cache_key;
pub mod cache_types;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod health;
pub mod http_proxy;
pub mod inflight_tracker;
pub mod logging;
pub mod permissions;
pub mod shutdown;
pub mod sweeper;

pub use error::{ProxyError, Result};
