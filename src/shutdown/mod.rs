//! Graceful shutdown handling for the relay.
//!
//! Shutdown runs in three phases:
//! 1. Background tasks are signalled to stop
//! 2. Every in-flight request queue is closed so waiting requests fail fast
//! 3. Every tenant connection is closed with `1001 server shutting down`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::connection_manager::ConnectionRegistry;
use crate::websocket::CloseReason;

pub struct GracefulShutdown {
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GracefulShutdown {
    pub fn new(registry: Arc<ConnectionRegistry>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            registry,
            shutdown_tx,
        }
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.registry.connection_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling background tasks");
        // No receivers left is fine
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 2: Closing in-flight request queues");
        result.queues_closed = self.registry.close_all_message_queues();

        tracing::info!("Phase 3: Closing tenant connections");
        result.connections_closed = self.registry.close_all_connections(CloseReason::Shutdown);

        result.duration = start.elapsed();
        result.success = self.registry.connection_count() == 0 && self.registry.queue_count() == 0;

        tracing::info!(
            queues_closed = result.queues_closed,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Registry ended empty
    pub success: bool,
    pub queues_closed: usize,
    pub connections_closed: usize,
    pub duration: Duration,
}
