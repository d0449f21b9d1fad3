//! Graceful Shutdown Module
//!
//! Handles signal-driven shutdown: the accept loop, health server and
//! retention sweeper stop on the broadcast signal, then in-flight fetches are
//! given until the shutdown timeout to finish publishing.

use crate::inflight_tracker::InFlightTracker;
use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    /// In-flight registry of the fetch coordinator, drained before exit
    inflight: Option<Arc<InFlightTracker>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            inflight: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Set the registry whose fetches must finish before shutdown completes
    pub fn set_inflight_tracker(&mut self, inflight: Arc<InFlightTracker>) {
        self.inflight = Some(inflight);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Convenience wrapper returning a [`ShutdownSignal`]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.subscribe())
    }

    /// Start listening for shutdown signals
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        // Listen for SIGINT (Ctrl+C) and SIGTERM
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Initiate graceful shutdown sequence
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            // No receivers left is normal late in shutdown
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(Ok(())) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Error during graceful shutdown: {}", e);
                Err(e)
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}, forcing shutdown",
                    self.shutdown_timeout
                );
                Err(ProxyError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }

    async fn perform_shutdown(&self) -> Result<()> {
        if let Some(inflight) = &self.inflight {
            let active = inflight.in_flight_count();
            if active > 0 {
                info!("Waiting for {} in-flight fetches to finish", active);
            }
            if !inflight.wait_until_idle(self.shutdown_timeout).await {
                warn!(
                    "{} fetches still running at shutdown; their partial files are removed on next start",
                    inflight.in_flight_count()
                );
                return Err(ProxyError::TimeoutError(
                    "In-flight fetches did not finish".to_string(),
                ));
            }
        }

        // Give a moment for final log messages to be written
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        // Closed and lagged both mean the sender is gone or has fired
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
        Ok(())
    }

    /// Try to receive shutdown signal without blocking
    pub fn try_recv_shutdown(&mut self) -> bool {
        match self.receiver.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => false,
            _ => {
                self.shutdown_requested = true;
                true
            }
        }
    }
}
