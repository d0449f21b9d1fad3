//! Health Check Module
//!
//! Provides the health endpoint: storage availability, fetch pool load and
//! coordinator statistics.

use crate::cache_types::StatsSnapshot;
use crate::coordinator::FetchCoordinator;
use crate::fetcher::ContentFetcher;
use crate::permissions::PermissionValidator;
use crate::{ProxyError, Result};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Health check status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Component health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: SystemTime,
    pub response_time_ms: Option<u64>,
}

/// Overall system health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub timestamp: SystemTime,
    pub components: Vec<ComponentHealth>,
    pub uptime_seconds: u64,
    pub statistics: Option<StatsSnapshot>,
}

/// Read-only view of the fetch coordinator, independent of its fetcher type.
pub trait FetchPoolProbe: Send + Sync {
    fn in_flight_count(&self) -> usize;
    fn worker_limit(&self) -> usize;
    fn stats(&self) -> StatsSnapshot;
}

impl<F: ContentFetcher> FetchPoolProbe for FetchCoordinator<F> {
    fn in_flight_count(&self) -> usize {
        FetchCoordinator::in_flight_count(self)
    }

    fn worker_limit(&self) -> usize {
        FetchCoordinator::worker_limit(self)
    }

    fn stats(&self) -> StatsSnapshot {
        FetchCoordinator::stats(self)
    }
}

/// Health check manager
pub struct HealthManager {
    start_time: SystemTime,
    storage_dir: Option<PathBuf>,
    /// Failure recorded while preparing storage at startup
    storage_init_error: Option<String>,
    fetch_pool: Option<Arc<dyn FetchPoolProbe>>,
}

impl Default for HealthManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthManager {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            storage_dir: None,
            storage_init_error: None,
            fetch_pool: None,
        }
    }

    pub fn set_storage_dir(&mut self, storage_dir: PathBuf) {
        self.storage_dir = Some(storage_dir);
    }

    pub fn set_storage_init_error(&mut self, error: String) {
        self.storage_init_error = Some(error);
    }

    pub fn set_fetch_pool(&mut self, fetch_pool: Arc<dyn FetchPoolProbe>) {
        self.fetch_pool = Some(fetch_pool);
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> SystemHealth {
        let start_time = SystemTime::now();
        let mut components = Vec::new();

        if let Some(storage_dir) = &self.storage_dir {
            components.push(self.check_storage_health(storage_dir).await);
        }

        if let Some(fetch_pool) = &self.fetch_pool {
            components.push(Self::check_fetch_pool_health(fetch_pool.as_ref()));
        }

        let overall_status = Self::determine_overall_status(&components);

        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or(Duration::from_secs(0))
            .as_secs();

        SystemHealth {
            status: overall_status,
            timestamp: start_time,
            components,
            uptime_seconds: uptime,
            statistics: self.fetch_pool.as_ref().map(|pool| pool.stats()),
        }
    }

    async fn check_storage_health(&self, storage_dir: &Path) -> ComponentHealth {
        let start_time = SystemTime::now();

        let dir = storage_dir.to_path_buf();
        let probe = tokio::task::spawn_blocking(move || PermissionValidator::check_writable(&dir))
            .await
            .unwrap_or_else(|e| Err(format!("storage probe failed: {}", e)));

        let response_time = start_time
            .elapsed()
            .unwrap_or(Duration::from_millis(0))
            .as_millis() as u64;

        let (status, message) = match (probe, &self.storage_init_error) {
            (Ok(()), None) => (
                HealthStatus::Healthy,
                format!("Storage writable: {}", storage_dir.display()),
            ),
            // Recovered since startup, e.g. a volume mounted late
            (Ok(()), Some(init_error)) => (
                HealthStatus::Degraded,
                format!("Storage writable now; startup failed: {}", init_error),
            ),
            (Err(e), _) => (HealthStatus::Unhealthy, format!("Storage unavailable: {}", e)),
        };

        ComponentHealth {
            name: "storage".to_string(),
            status,
            message: Some(message),
            last_check: start_time,
            response_time_ms: Some(response_time),
        }
    }

    fn check_fetch_pool_health(fetch_pool: &dyn FetchPoolProbe) -> ComponentHealth {
        let in_flight = fetch_pool.in_flight_count();
        let limit = fetch_pool.worker_limit();

        // Saturated pool still serves cache hits
        let status = if in_flight >= limit {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ComponentHealth {
            name: "fetch_pool".to_string(),
            status,
            message: Some(format!("{} of {} workers busy", in_flight.min(limit), limit)),
            last_check: SystemTime::now(),
            response_time_ms: None,
        }
    }

    fn determine_overall_status(components: &[ComponentHealth]) -> HealthStatus {
        if components
            .iter()
            .any(|c| c.status == HealthStatus::Unhealthy)
        {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Handle health check HTTP request
    pub async fn handle_health_request<B>(&self, _req: Request<B>) -> Result<Response<String>> {
        let health = self.check_health().await;

        let status_code = match health.status {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::OK, // Still return 200 for degraded
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = serde_json::to_string_pretty(&health).map_err(|e| {
            ProxyError::SerializationError(format!("Failed to serialize health status: {}", e))
        })?;

        Response::builder()
            .status(status_code)
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| ProxyError::HttpError(format!("Failed to build health response: {}", e)))
    }
}
