//! Graceful shutdown handling for the broker.
//!
//! This module provides coordinated shutdown functionality that:
//! 1. Asks every connection to close with code 4200
//! 2. Signals background tasks to stop
//! 3. Waits for connections to drain, then deregisters the rest

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection_manager::{CloseReason, ConnectionRegistry};

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for connections to close (default: 10 seconds)
    pub drain_timeout: Duration,
    /// Polling period while draining
    pub poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Handles graceful shutdown of the broker
pub struct GracefulShutdown {
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    /// Create a new graceful shutdown handler
    pub fn new(registry: Arc<ConnectionRegistry>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(registry, shutdown_tx, ShutdownConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(
        registry: Arc<ConnectionRegistry>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            shutdown_tx,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.registry.count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        // Phase 1: Ask every connection to close
        tracing::info!(
            reason = %reason,
            "Starting graceful shutdown - Phase 1: Closing client connections"
        );
        result.clients_notified = self.notify_clients();

        // Phase 2: Signal background tasks to stop
        tracing::info!("Phase 2: Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        // Phase 3: Wait for connections to close
        tracing::info!("Phase 3: Waiting for connections to close");
        result.connections_closed = self.wait_for_connections_to_close().await;
        result.connections_forced = self.force_deregister().await;

        result.duration = start.elapsed();

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            connections_forced = result.connections_forced,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    fn notify_clients(&self) -> usize {
        let connections = self.registry.all();
        for conn in &connections {
            conn.close(CloseReason::ServerShutdown);
        }
        connections.len()
    }

    /// Wait for connections to close gracefully
    async fn wait_for_connections_to_close(&self) -> usize {
        let initial = self.registry.count();
        if initial == 0 {
            return 0;
        }

        let wait_future = async {
            while self.registry.count() > 0 {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        let _ = timeout(self.config.drain_timeout, wait_future).await;

        initial.saturating_sub(self.registry.count())
    }

    /// Deregister connections whose gateway did not finish in time
    async fn force_deregister(&self) -> usize {
        let remaining = self.registry.all();
        if remaining.is_empty() {
            return 0;
        }

        tracing::warn!(
            remaining_connections = remaining.len(),
            "Some connections did not close gracefully"
        );

        let mut forced = 0;
        for conn in remaining {
            if self.registry.deregister(&conn.id).await {
                forced += 1;
            }
        }
        forced
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Number of clients asked to close
    pub clients_notified: usize,
    /// Number of connections that closed on their own
    pub connections_closed: usize,
    /// Number of connections deregistered after the drain timeout
    pub connections_forced: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}
