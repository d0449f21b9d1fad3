use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use video_cache_proxy::{
    cache_key::StorageLayout,
    config::Config,
    coordinator::{CoordinatorSettings, FetchCoordinator},
    fetcher::YtDlpFetcher,
    health::HealthManager,
    http_proxy::{HttpProxy, ProxySettings},
    logging::LoggerManager,
    permissions::PermissionValidator,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    sweeper::RetentionSweeper,
    ProxyError, Result,
};

/// Start health check HTTP server
async fn start_health_server(
    addr: SocketAddr,
    endpoint: String,
    health_manager: Arc<RwLock<HealthManager>>,
    mut shutdown_signal: ShutdownSignal,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::IoError(format!("Failed to bind health server: {}", e)))?;

    info!("Health check server listening on {}{}", addr, endpoint);
    let endpoint = Arc::new(endpoint);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _) = accept_result.map_err(|e| {
                    ProxyError::IoError(format!("Failed to accept connection: {}", e))
                })?;

                let io = TokioIo::new(stream);
                let health_manager_clone = health_manager.clone();
                let endpoint = Arc::clone(&endpoint);

                tokio::spawn(async move {
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let health_manager = health_manager_clone.clone();
                        let endpoint = Arc::clone(&endpoint);
                        async move {
                            if req.uri().path() != endpoint.as_str() {
                                return Response::builder()
                                    .status(StatusCode::NOT_FOUND)
                                    .body(String::new())
                                    .map_err(|e| ProxyError::HttpError(e.to_string()));
                            }
                            health_manager.read().await.handle_health_request(req).await
                        }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving health check connection: {}", e);
                    }
                });
            }
            _ = shutdown_signal.wait_for_shutdown() => {
                info!("Health check server received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Logging is required; storage problems are reported through health
    PermissionValidator::validate_log_dir(&config.logging.app_log_dir)?;

    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let logger = LoggerManager::new(config.logging.clone(), hostname);
    logger.initialize()?;
    logger.rotate_logs();

    info!(
        "Starting video cache proxy v{} (built: {})",
        env!("BUILD_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    info!(
        "HTTP: {}:{}, api_mode={}, upstream={}",
        config.server.bind_address,
        config.server.http_port,
        config.server.api_mode,
        config.upstream.base_url
    );
    info!(
        "Storage: dir={}, extension={}, retention={:?}, sweep_interval={:?}",
        config.storage.storage_dir.display(),
        config.storage.file_extension,
        config.retention.retention_window,
        config.retention.sweep_interval
    );
    info!(
        "Fetch: downloader={}, workers={}, fetch_timeout={:?}, wait_timeout={:?}",
        config.fetch.downloader_path.display(),
        config.fetch.worker_pool_size,
        config.fetch.fetch_timeout,
        config.fetch.wait_timeout
    );

    let mut health_manager = HealthManager::new();
    health_manager.set_storage_dir(config.storage.storage_dir.clone());

    if let Err(e) = PermissionValidator::validate_storage_dir(&config.storage.storage_dir) {
        error!("Storage directory unavailable at startup: {}", e);
        health_manager.set_storage_init_error(e.to_string());
    }

    let layout = StorageLayout::new(
        config.storage.storage_dir.clone(),
        config.storage.file_extension.clone(),
    );
    let fetcher = Arc::new(YtDlpFetcher::from_config(
        &config.fetch,
        &config.storage.file_extension,
    ));
    let coordinator = Arc::new(FetchCoordinator::new(
        layout.clone(),
        fetcher,
        CoordinatorSettings::from_config(&config.fetch),
    ));

    match coordinator.initialize().await {
        Ok(removed) if removed > 0 => {
            info!("Removed {} partial files left by a previous run", removed)
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to clean partial directory: {}", e),
    }

    health_manager.set_fetch_pool(coordinator.clone());
    let health_manager = Arc::new(RwLock::new(health_manager));

    let mut shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    shutdown_coordinator.set_inflight_tracker(coordinator.inflight_tracker());

    let sweeper = RetentionSweeper::from_config(layout, &config.retention);
    let sweeper_shutdown = shutdown_coordinator.signal();
    let sweeper_task = tokio::spawn(sweeper.run(sweeper_shutdown));

    let _health_task = if config.health.enabled {
        info!("Starting health check server on port {}", config.health.port);
        // Bind to [::] for IPv6 dual-stack (accepts both IPv4 and IPv6)
        let health_addr = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], config.health.port));
        let health_shutdown = shutdown_coordinator.signal();
        let endpoint = config.health.endpoint.clone();
        let health_manager_clone = health_manager.clone();

        Some(tokio::spawn(async move {
            if let Err(e) =
                start_health_server(health_addr, endpoint, health_manager_clone, health_shutdown)
                    .await
            {
                error!("Health check server failed: {}", e);
            }
        }))
    } else {
        None
    };

    let bind_ip: IpAddr = config.server.bind_address.parse().map_err(|e| {
        ProxyError::ConfigError(format!(
            "Invalid bind address '{}': {}",
            config.server.bind_address, e
        ))
    })?;
    let http_addr = SocketAddr::new(bind_ip, config.server.http_port);
    let http_proxy = HttpProxy::new(
        http_addr,
        ProxySettings::from_config(&config),
        coordinator,
        config.server.max_concurrent_requests,
    );

    let http_shutdown = shutdown_coordinator.signal();
    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator failed: {}", e);
        }
    });

    let http_task = tokio::spawn(async move {
        if let Err(e) = http_proxy.start(http_shutdown).await {
            error!("HTTP proxy failed: {}", e);
        }
    });

    shutdown_task.await.ok();
    info!("Shutdown coordinator completed, waiting for server tasks");

    let _ = tokio::time::timeout(Duration::from_secs(6), http_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), sweeper_task).await;

    info!("Video cache proxy shutdown complete");
    Ok(())
}
