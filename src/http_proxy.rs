//! HTTP Proxy Module
//!
//! Thin transport over the fetch coordinator. A request path (plus query) is
//! appended to the upstream base URL to form the source identifier; the
//! response is either the cached file streamed from disk, a 202 asking the
//! client to retry, or a JSON error.

use crate::cache_types::{CacheEntry, PollOutcome};
use crate::config::{ApiMode, Config};
use crate::coordinator::FetchCoordinator;
use crate::fetcher::ContentFetcher;
use crate::shutdown::ShutdownSignal;
use crate::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Read size when streaming a cached file
const STREAM_CHUNK_SIZE: usize = 512 * 1024;

/// How long the accept loop waits for open connections after shutdown
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Transport settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub api_mode: ApiMode,
    pub upstream_base_url: String,
    pub content_type: String,
    pub retry_after_secs: u64,
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_mode: config.server.api_mode,
            upstream_base_url: config.upstream.base_url.clone(),
            content_type: config.storage.content_type.clone(),
            retry_after_secs: config.server.retry_after_secs,
        }
    }

    /// Builds the source identifier for a request, or `None` when the request
    /// names nothing (bare `/` without a query).
    pub fn source_identifier(&self, path: &str, query: Option<&str>) -> Option<String> {
        let query = query.filter(|q| !q.is_empty());
        if (path.is_empty() || path == "/") && query.is_none() {
            return None;
        }

        let mut identifier = self.upstream_base_url.trim_end_matches('/').to_string();
        if !path.starts_with('/') {
            identifier.push('/');
        }
        identifier.push_str(path);
        if let Some(query) = query {
            identifier.push('?');
            identifier.push_str(query);
        }
        Some(identifier)
    }
}

pub struct HttpProxy<F: ContentFetcher> {
    listen_addr: SocketAddr,
    settings: Arc<ProxySettings>,
    coordinator: Arc<FetchCoordinator<F>>,
    request_semaphore: Arc<Semaphore>,
    active_connections: Arc<AtomicUsize>,
}

impl<F: ContentFetcher> HttpProxy<F> {
    pub fn new(
        listen_addr: SocketAddr,
        settings: ProxySettings,
        coordinator: Arc<FetchCoordinator<F>>,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            listen_addr,
            settings: Arc::new(settings),
            coordinator,
            request_semaphore: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accept connections until shutdown, then drain open connections.
    pub async fn start(&self, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(
            "HTTP proxy listening on {} (api_mode={})",
            self.listen_addr, self.settings.api_mode
        );

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let settings = Arc::clone(&self.settings);
                            let coordinator = Arc::clone(&self.coordinator);
                            let request_semaphore = Arc::clone(&self.request_semaphore);
                            let active_connections = Arc::clone(&self.active_connections);

                            tokio::spawn(async move {
                                Self::serve_connection(
                                    stream,
                                    addr,
                                    settings,
                                    coordinator,
                                    request_semaphore,
                                    active_connections,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP proxy received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        let drain_start = Instant::now();
        let active = self.active_connections.load(Ordering::Relaxed);
        if active > 0 {
            info!(
                "HTTP proxy draining {} active connections (timeout: {:?})",
                active, CONNECTION_DRAIN_TIMEOUT
            );
            while self.active_connections.load(Ordering::Relaxed) > 0
                && drain_start.elapsed() < CONNECTION_DRAIN_TIMEOUT
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let remaining = self.active_connections.load(Ordering::Relaxed);
            if remaining > 0 {
                warn!("HTTP proxy shutdown with {} connections still active", remaining);
            } else {
                info!("HTTP proxy all connections drained");
            }
        }

        info!("HTTP proxy stopped");
        Ok(())
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        settings: Arc<ProxySettings>,
        coordinator: Arc<FetchCoordinator<F>>,
        request_semaphore: Arc<Semaphore>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let settings = Arc::clone(&settings);
            let coordinator = Arc::clone(&coordinator);
            let request_semaphore = Arc::clone(&request_semaphore);

            async move {
                Self::handle_request(req, settings, coordinator, request_semaphore).await
            }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            let err_str = err.to_string();
            if err_str.contains("connection closed")
                || err_str.contains("broken pipe")
                || err_str.contains("reset by peer")
                || err.is_canceled()
            {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Handle a single HTTP request. The request body is never read.
    pub async fn handle_request<B>(
        req: Request<B>,
        settings: Arc<ProxySettings>,
        coordinator: Arc<FetchCoordinator<F>>,
        request_semaphore: Arc<Semaphore>,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        let start_time = Instant::now();
        let retry_after = settings.retry_after_secs.to_string();

        let _permit = match request_semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Request limit exceeded, returning 429");
                return Ok(build_error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "TooManyRequests",
                    "Too many concurrent requests. Please retry later.",
                    Some(&retry_after),
                ));
            }
        };

        let method = req.method().clone();
        let uri = req.uri().clone();

        let response = match method {
            Method::GET | Method::HEAD => {
                match settings.source_identifier(uri.path(), uri.query()) {
                    Some(identifier) => {
                        let head_only = method == Method::HEAD;
                        match settings.api_mode {
                            ApiMode::Async => {
                                Self::respond_async(&settings, &coordinator, &identifier, head_only)
                                    .await
                            }
                            ApiMode::Blocking => {
                                Self::respond_blocking(
                                    &settings,
                                    &coordinator,
                                    &identifier,
                                    head_only,
                                )
                                .await
                            }
                        }
                    }
                    None => build_error_response(
                        StatusCode::BAD_REQUEST,
                        "InvalidRequest",
                        "Request path must name a video",
                        None,
                    ),
                }
            }
            _ => {
                let mut response = build_error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "MethodNotAllowed",
                    &format!("Method {} is not supported", method),
                    None,
                );
                response
                    .headers_mut()
                    .insert(hyper::header::ALLOW, hyper::header::HeaderValue::from_static("GET, HEAD"));
                response
            }
        };

        info!(
            "{} {} -> {} ({}ms)",
            method,
            uri,
            response.status().as_u16(),
            start_time.elapsed().as_millis()
        );
        Ok(response)
    }

    async fn respond_async(
        settings: &ProxySettings,
        coordinator: &FetchCoordinator<F>,
        identifier: &str,
        head_only: bool,
    ) -> Response<ProxyBody> {
        let retry_after = settings.retry_after_secs.to_string();
        match coordinator.poll(identifier).await {
            Ok(PollOutcome::Ready(entry)) => {
                match serve_entry(&entry, &settings.content_type, head_only).await {
                    Ok(Some(response)) => response,
                    // Swept between lookup and open; fetch it again
                    Ok(None) => {
                        coordinator.trigger_fetch(identifier);
                        accepted_response(&retry_after)
                    }
                    Err(e) => error_response_for(&e, None),
                }
            }
            Ok(PollOutcome::Accepted { newly_triggered }) => {
                if newly_triggered {
                    debug!("Fetch accepted for {}", identifier);
                }
                accepted_response(&retry_after)
            }
            Ok(PollOutcome::Failed { cause }) => build_error_response(
                StatusCode::BAD_GATEWAY,
                "FetchFailed",
                &cause,
                None,
            ),
            Err(e) => error_response_for(&e, Some(&retry_after)),
        }
    }

    async fn respond_blocking(
        settings: &ProxySettings,
        coordinator: &FetchCoordinator<F>,
        identifier: &str,
        head_only: bool,
    ) -> Response<ProxyBody> {
        let entry = match coordinator.retrieve_blocking(identifier).await {
            Ok(entry) => entry,
            Err(e) => return error_response_for(&e, None),
        };
        match serve_entry(&entry, &settings.content_type, head_only).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                // One retry covers a sweep racing the read
                let retried = match coordinator.retrieve_blocking(identifier).await {
                    Ok(entry) => serve_entry(&entry, &settings.content_type, head_only).await,
                    Err(e) => Err(e),
                };
                match retried {
                    Ok(Some(response)) => response,
                    Ok(None) => error_response_for(
                        &ProxyError::StorageError(format!(
                            "entry for {} was removed while being served",
                            identifier
                        )),
                        None,
                    ),
                    Err(e) => error_response_for(&e, None),
                }
            }
            Err(e) => error_response_for(&e, None),
        }
    }
}

/// Maps coordinator errors to HTTP statuses.
pub fn status_for_error(error: &ProxyError) -> StatusCode {
    match error {
        ProxyError::FetchError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ProxyError::LockTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ProxyError::StorageError(_) => StatusCode::SERVICE_UNAVAILABLE,
        ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response_for(error: &ProxyError, retry_after: Option<&str>) -> Response<ProxyBody> {
    let status = status_for_error(error);
    let retry_after = retry_after.filter(|_| status == StatusCode::SERVICE_UNAVAILABLE);
    build_error_response(status, error.code(), &error.to_string(), retry_after)
}

fn accepted_response(retry_after: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header("retry-after", retry_after)
        .header("content-length", 0)
        .body(empty_body())
        .unwrap_or_else(|_| fallback_response(StatusCode::ACCEPTED))
}

/// Opens a published entry and streams it in fixed-size chunks.
///
/// Returns `None` when the file was removed after the lookup that produced
/// `entry`.
async fn serve_entry(
    entry: &CacheEntry,
    content_type: &str,
    head_only: bool,
) -> Result<Option<Response<ProxyBody>>> {
    let file = match tokio::fs::File::open(&entry.path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Entry {} removed before it could be read", entry.key);
            return Ok(None);
        }
        Err(e) => {
            return Err(ProxyError::StorageError(format!(
                "Failed to open {:?}: {}",
                entry.path, e
            )))
        }
    };
    let length = file
        .metadata()
        .await
        .map(|m| m.len())
        .unwrap_or(entry.size);

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", content_type)
        .header("content-length", length)
        .header("x-cache-key", entry.key.as_str());

    let body = if head_only {
        empty_body()
    } else {
        stream_file(file)
    };

    builder
        .body(body)
        .map(Some)
        .map_err(|e| ProxyError::HttpError(format!("Failed to build response: {}", e)))
}

/// Bridges a file to a response body through a channel of frames. A read
/// error drops the sender, which ends the body early and aborts the
/// connection.
fn stream_file(mut file: tokio::fs::File) -> ProxyBody {
    let (frame_tx, frame_rx) =
        mpsc::channel::<std::result::Result<Frame<Bytes>, hyper::Error>>(4);

    tokio::spawn(async move {
        let mut buffer = BytesMut::with_capacity(STREAM_CHUNK_SIZE);
        loop {
            buffer.reserve(STREAM_CHUNK_SIZE);
            match file.read_buf(&mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = buffer.split().freeze();
                    if frame_tx.send(Ok(Frame::data(chunk))).await.is_err() {
                        debug!("Stream receiver dropped, stopping disk read");
                        break;
                    }
                }
                Err(e) => {
                    error!("Mid-stream disk read error, terminating connection: {}", e);
                    break;
                }
            }
        }
    });

    let frame_stream = futures::stream::unfold(frame_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    BoxBody::new(StreamBody::new(frame_stream))
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn fallback_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// Build a JSON error response
pub fn build_error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    retry_after: Option<&str>,
) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "code": code,
        "message": message,
        "request_id": Uuid::new_v4().to_string(),
    })
    .to_string();

    let mut response_builder = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("content-length", body.len());

    if let Some(retry_value) = retry_after {
        response_builder = response_builder.header("retry-after", retry_value);
    }

    response_builder
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap_or_else(|_| fallback_response(status))
}
