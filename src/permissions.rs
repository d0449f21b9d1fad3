use crate::cache_key::PARTIAL_DIR_NAME;
use crate::{ProxyError, Result};
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

const PROBE_FILE_NAME: &str = ".permission_test";

/// Validates directory permissions on startup
pub struct PermissionValidator;

impl PermissionValidator {
    /// Validate the application log directory. The proxy cannot start without it.
    pub fn validate_log_dir(app_log_dir: &Path) -> Result<()> {
        Self::validate_directory(app_log_dir, "Application log")
            .map_err(ProxyError::ConfigError)
    }

    /// Validate the storage directory and create its partial subdirectory.
    pub fn validate_storage_dir(storage_dir: &Path) -> Result<()> {
        Self::validate_directory(storage_dir, "Storage").map_err(ProxyError::StorageError)?;

        let partial_dir = storage_dir.join(PARTIAL_DIR_NAME);
        fs::create_dir_all(&partial_dir).map_err(|e| {
            error!("Failed to create partial directory {:?}: {}", partial_dir, e);
            ProxyError::StorageError(format!(
                "Failed to create partial directory '{}': {}",
                partial_dir.display(),
                e
            ))
        })
    }

    /// Non-creating check used by the health endpoint: the directory must
    /// exist, be listable and accept a new file.
    pub fn check_writable(dir_path: &Path) -> std::result::Result<(), String> {
        if !dir_path.is_dir() {
            return Err(format!("'{}' does not exist", dir_path.display()));
        }
        fs::read_dir(dir_path)
            .map_err(|e| format!("'{}' is not readable: {}", dir_path.display(), e))?;
        let probe = dir_path.join(PROBE_FILE_NAME);
        fs::write(&probe, b"test")
            .map_err(|e| format!("'{}' is not writable: {}", dir_path.display(), e))?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }

    /// Validate a single directory has read/write permissions, creating it
    /// when missing.
    fn validate_directory(path: &Path, dir_type: &str) -> std::result::Result<(), String> {
        let dir_path_str = path.display();

        if !path.exists() {
            info!(
                "{} directory does not exist, attempting to create: {}",
                dir_type, dir_path_str
            );

            if let Err(e) = fs::create_dir_all(path) {
                error!("{} directory creation failed: {}", dir_type, dir_path_str);
                return Err(format!(
                    "Failed to create {} directory '{}': {}\n\n\
                    Please ensure:\n\
                    1. The parent directory exists and is writable\n\
                    2. You have permission to create directories in this location\n\n\
                    Suggested fix:\n\
                    sudo mkdir -p {}\n\
                    sudo chown $USER:$USER {}",
                    dir_type, dir_path_str, e, dir_path_str, dir_path_str
                ));
            }

            info!("{} directory created successfully: {}", dir_type, dir_path_str);
        }

        if let Err(e) = fs::read_dir(path) {
            error!("{} directory is not readable: {}", dir_type, dir_path_str);
            return Err(format!(
                "Cannot read {} directory '{}': {}\n\n\
                Suggested fix:\n\
                sudo chmod u+r {}",
                dir_type, dir_path_str, e, dir_path_str
            ));
        }

        let test_file = path.join(PROBE_FILE_NAME);
        if let Err(e) = fs::write(&test_file, b"test") {
            error!("{} directory is not writable: {}", dir_type, dir_path_str);
            return Err(format!(
                "Cannot write to {} directory '{}': {}\n\n\
                Suggested fix:\n\
                sudo chmod u+w {}\n\
                sudo chown $USER:$USER {}",
                dir_type, dir_path_str, e, dir_path_str, dir_path_str
            ));
        }

        if let Err(e) = fs::remove_file(&test_file) {
            warn!("Failed to remove permission test file: {}", e);
        }

        info!("{} directory permissions validated: {}", dir_type, dir_path_str);
        Ok(())
    }
}
