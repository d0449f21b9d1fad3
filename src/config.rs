//! Configuration Module
//!
//! Layered configuration: built-in defaults, then an optional YAML file, then
//! environment variables, then command line flags.

use crate::{ProxyError, Result};
use clap::{Arg, ArgAction, Command};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Custom deserializer for PathBuf that expands tilde (~) to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let seconds = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            "d" | "day" | "days" => value * 86400.0,
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            "" => value, // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Duration::try_from_secs_f64(seconds)
            .map_err(|e| format!("Duration '{}' out of range: {}", s, e))
    }
}

pub use duration_serde::parse_duration;

/// Which retrieval contract the HTTP surface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// Hold the request open until the entry is published.
    Blocking,
    /// Answer 202 and let the client retry until the entry is ready.
    #[default]
    Async,
}

impl FromStr for ApiMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "blocking" | "sync" => Ok(ApiMode::Blocking),
            "async" | "poll" => Ok(ApiMode::Async),
            other => Err(format!("Unknown API mode: {}", other)),
        }
    }
}

impl fmt::Display for ApiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiMode::Blocking => f.write_str("blocking"),
            ApiMode::Async => f.write_str("async"),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default)]
    pub api_mode: ApiMode,
    /// Value of the `retry-after` header on 202 and 429 responses
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub shutdown_timeout: Duration,
}

fn default_http_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_max_concurrent_requests() -> usize {
    200
}

fn default_retry_after_secs() -> u64 {
    5
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            bind_address: default_bind_address(),
            max_concurrent_requests: default_max_concurrent_requests(),
            api_mode: ApiMode::default(),
            retry_after_secs: default_retry_after_secs(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Where request paths are resolved against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "https://www.youtube.com".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

/// Cache storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(
        default = "default_storage_dir",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub storage_dir: PathBuf,
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/app/downloads")
}

fn default_file_extension() -> String {
    "mp4".to_string()
}

fn default_content_type() -> String {
    "video/mp4".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            file_extension: default_file_extension(),
            content_type: default_content_type(),
        }
    }
}

/// External fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(
        default = "default_downloader_path",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub downloader_path: PathBuf,
    #[serde(default = "default_format_selector")]
    pub format_selector: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(
        default = "default_fetch_timeout",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub fetch_timeout: Duration,
    /// How long a blocking caller waits on an in-flight fetch
    #[serde(
        default = "default_wait_timeout",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub wait_timeout: Duration,
}

fn default_downloader_path() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_format_selector() -> String {
    "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string()
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(35 * 60)
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            downloader_path: default_downloader_path(),
            format_selector: default_format_selector(),
            extra_args: Vec::new(),
            worker_pool_size: default_worker_pool_size(),
            fetch_timeout: default_fetch_timeout(),
            wait_timeout: default_wait_timeout(),
        }
    }
}

/// Retention sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(
        default = "default_retention_window",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub retention_window: Duration,
    #[serde(
        default = "default_sweep_interval",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub sweep_interval: Duration,
}

fn default_retention_window() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(3600)
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_window: default_retention_window(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(
        default = "default_app_log_dir",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub app_log_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

fn default_app_log_dir() -> PathBuf {
    PathBuf::from("/logs/app")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_log_dir: default_app_log_dir(),
            log_level: default_log_level(),
            file_logging_enabled: true,
            log_retention_days: default_log_retention_days(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
    #[serde(default = "default_health_endpoint")]
    pub endpoint: String,
}

fn default_health_port() -> u16 {
    8081
}

fn default_health_endpoint() -> String {
    "/health".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_health_port(),
            endpoint: default_health_endpoint(),
        }
    }
}

/// Upper bound on concurrent external fetches
const MAX_WORKER_POOL_SIZE: usize = 64;

impl Config {
    /// Load configuration from the process command line and environment
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches, |name| std::env::var(name).ok())
    }

    /// Builds the configuration from parsed flags and an environment lookup.
    pub fn from_matches<E>(matches: &clap::ArgMatches, env: E) -> Result<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut config = match matches.get_one::<String>("config") {
            Some(config_path) => Self::load_from_file(config_path)?,
            None => Self::default(),
        };

        config.apply_env_overrides(env);
        config.apply_cli_overrides(matches)?;
        config.validate()?;

        info!(
            "Configuration: api_mode={}, storage_dir={:?}, workers={}, fetch_timeout={:?}, retention={:?}, sweep_interval={:?}",
            config.server.api_mode,
            config.storage.storage_dir,
            config.fetch.worker_pool_size,
            config.fetch.fetch_timeout,
            config.retention.retention_window,
            config.retention.sweep_interval
        );
        Ok(config)
    }

    pub fn build_cli() -> Command {
        Command::new("video-cache-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Caching proxy that fetches videos once and serves them from disk")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("http-port")
                    .long("http-port")
                    .value_name("PORT")
                    .help("HTTP port (default: 8080)"),
            )
            .arg(
                Arg::new("bind-address")
                    .long("bind-address")
                    .value_name("ADDR")
                    .help("Address to listen on (default: 0.0.0.0)"),
            )
            .arg(
                Arg::new("api-mode")
                    .long("api-mode")
                    .value_name("MODE")
                    .help("Retrieval contract: async (default) or blocking"),
            )
            .arg(
                Arg::new("upstream-base-url")
                    .long("upstream-base-url")
                    .value_name("URL")
                    .help("Base URL request paths are appended to"),
            )
            .arg(
                Arg::new("storage-dir")
                    .long("storage-dir")
                    .value_name("DIR")
                    .help("Directory holding cached files"),
            )
            .arg(
                Arg::new("downloader-path")
                    .long("downloader-path")
                    .value_name("PATH")
                    .help("Downloader executable (default: yt-dlp)"),
            )
            .arg(
                Arg::new("worker-pool-size")
                    .long("worker-pool-size")
                    .value_name("COUNT")
                    .help("Maximum number of concurrent fetches"),
            )
            .arg(
                Arg::new("retention-window")
                    .long("retention-window")
                    .value_name("DURATION")
                    .help("Delete files not accessed for this long (e.g. 24h)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("health-enabled")
                    .long("health-enabled")
                    .action(ArgAction::SetTrue)
                    .help("Enable health check endpoint"),
            )
    }

    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides. Unparseable values are ignored
    /// with a warning.
    pub fn apply_env_overrides<E>(&mut self, env: E)
    where
        E: Fn(&str) -> Option<String>,
    {
        if let Some(port) = env("HTTP_PORT") {
            match port.parse() {
                Ok(port) => self.server.http_port = port,
                Err(_) => warn!("Ignoring invalid HTTP_PORT: {}", port),
            }
        }

        if let Some(address) = env("BIND_ADDRESS") {
            self.server.bind_address = address;
        }

        if let Some(mode) = env("API_MODE") {
            match mode.parse() {
                Ok(mode) => self.server.api_mode = mode,
                Err(e) => warn!("Ignoring API_MODE: {}", e),
            }
        }

        if let Some(base_url) = env("UPSTREAM_BASE_URL") {
            self.upstream.base_url = base_url;
        }

        if let Some(storage_dir) = env("STORAGE_DIR") {
            self.storage.storage_dir = pathbuf_serde::expand_tilde(&storage_dir);
        }

        if let Some(downloader) = env("DOWNLOADER_PATH") {
            self.fetch.downloader_path = pathbuf_serde::expand_tilde(&downloader);
        }

        if let Some(workers) = env("WORKER_POOL_SIZE") {
            match workers.parse() {
                Ok(workers) => self.fetch.worker_pool_size = workers,
                Err(_) => warn!("Ignoring invalid WORKER_POOL_SIZE: {}", workers),
            }
        }

        if let Some(value) = env("FETCH_TIMEOUT") {
            match parse_duration(&value) {
                Ok(timeout) => self.fetch.fetch_timeout = timeout,
                Err(e) => warn!("Ignoring FETCH_TIMEOUT: {}", e),
            }
        }

        if let Some(value) = env("RETENTION_WINDOW") {
            match parse_duration(&value) {
                Ok(window) => self.retention.retention_window = window,
                Err(e) => warn!("Ignoring RETENTION_WINDOW: {}", e),
            }
        }

        if let Some(value) = env("SWEEP_INTERVAL") {
            match parse_duration(&value) {
                Ok(interval) => self.retention.sweep_interval = interval,
                Err(e) => warn!("Ignoring SWEEP_INTERVAL: {}", e),
            }
        }

        if let Some(app_log_dir) = env("APP_LOG_DIR") {
            self.logging.app_log_dir = pathbuf_serde::expand_tilde(&app_log_dir);
        }

        if let Some(log_level) = env("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }

        if let Some(health) = env("HEALTH_ENABLED") {
            self.health.enabled = health.to_lowercase() == "true";
        }

        if let Some(port) = env("HEALTH_PORT") {
            match port.parse() {
                Ok(port) => self.health.port = port,
                Err(_) => warn!("Ignoring invalid HEALTH_PORT: {}", port),
            }
        }
    }

    /// Apply command line overrides. Unlike environment values, a malformed
    /// flag is an error.
    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) -> Result<()> {
        if let Some(port) = matches.get_one::<String>("http-port") {
            self.server.http_port = port.parse().map_err(|_| {
                ProxyError::ConfigError(format!("Invalid --http-port: {}", port))
            })?;
        }

        if let Some(address) = matches.get_one::<String>("bind-address") {
            self.server.bind_address = address.clone();
        }

        if let Some(mode) = matches.get_one::<String>("api-mode") {
            self.server.api_mode = mode.parse().map_err(ProxyError::ConfigError)?;
        }

        if let Some(base_url) = matches.get_one::<String>("upstream-base-url") {
            self.upstream.base_url = base_url.clone();
        }

        if let Some(storage_dir) = matches.get_one::<String>("storage-dir") {
            self.storage.storage_dir = pathbuf_serde::expand_tilde(storage_dir);
        }

        if let Some(downloader) = matches.get_one::<String>("downloader-path") {
            self.fetch.downloader_path = pathbuf_serde::expand_tilde(downloader);
        }

        if let Some(workers) = matches.get_one::<String>("worker-pool-size") {
            self.fetch.worker_pool_size = workers.parse().map_err(|_| {
                ProxyError::ConfigError(format!("Invalid --worker-pool-size: {}", workers))
            })?;
        }

        if let Some(window) = matches.get_one::<String>("retention-window") {
            self.retention.retention_window =
                parse_duration(window).map_err(ProxyError::ConfigError)?;
        }

        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = log_level.clone();
        }

        if matches.get_flag("health-enabled") {
            self.health.enabled = true;
        }

        Ok(())
    }

    /// Reject configurations the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        let workers = self.fetch.worker_pool_size;
        if workers == 0 || workers > MAX_WORKER_POOL_SIZE {
            return Err(ProxyError::ConfigError(format!(
                "fetch.worker_pool_size must be between 1 and {}, got {}",
                MAX_WORKER_POOL_SIZE, workers
            )));
        }

        let extension = self.storage.file_extension.trim_start_matches('.');
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProxyError::ConfigError(format!(
                "storage.file_extension must be non-empty and alphanumeric, got '{}'",
                self.storage.file_extension
            )));
        }

        if self.retention.retention_window.is_zero() {
            return Err(ProxyError::ConfigError(
                "retention.retention_window must be greater than zero".to_string(),
            ));
        }

        if self.retention.sweep_interval < Duration::from_secs(1) {
            return Err(ProxyError::ConfigError(format!(
                "retention.sweep_interval must be at least 1s, got {:?}",
                self.retention.sweep_interval
            )));
        }

        if self.upstream.base_url.trim().is_empty() {
            return Err(ProxyError::ConfigError(
                "upstream.base_url cannot be empty".to_string(),
            ));
        }

        if self.fetch.fetch_timeout.is_zero() {
            return Err(ProxyError::ConfigError(
                "fetch.fetch_timeout must be greater than zero".to_string(),
            ));
        }

        if self.fetch.wait_timeout < self.fetch.fetch_timeout {
            warn!(
                "fetch.wait_timeout ({:?}) is shorter than fetch.fetch_timeout ({:?}); blocking callers may give up on fetches that still succeed",
                self.fetch.wait_timeout, self.fetch.fetch_timeout
            );
        }

        Ok(())
    }
}
