//! Error Module
//!
//! Defines error types and result types used throughout the video cache proxy.

use thiserror::Error;

/// Main error type for the video cache proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// The external fetch failed: non-zero exit, could not start, produced no
    /// output, or exceeded its deadline.
    #[error("Fetch error: {0}")]
    FetchError(String),

    /// A caller waiting on an in-flight fetch exceeded its wait deadline.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Storage directory creation, listing, rename or deletion failed.
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl ProxyError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::FetchError(_) => "FetchFailed",
            ProxyError::LockTimeout(_) => "FetchWaitTimeout",
            ProxyError::StorageError(_) => "StorageUnavailable",
            ProxyError::IoError(_) => "IoError",
            ProxyError::HttpError(_) => "HttpError",
            ProxyError::ConfigError(_) => "ConfigError",
            ProxyError::TimeoutError(_) => "Timeout",
            ProxyError::SerializationError(_) => "SerializationError",
            ProxyError::InvalidRequest(_) => "InvalidRequest",
            ProxyError::InternalError(_) => "InternalError",
            ProxyError::SystemError(_) => "SystemError",
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for the video cache proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
