use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::WebSocketConfig;
use crate::connection_manager::ConnectionRegistry;

/// Timeout for individual ping sends
const HEARTBEAT_SEND_TIMEOUT_MS: u64 = 5000;

/// Background task that keeps tenant connections alive
pub struct HeartbeatTask {
    config: WebSocketConfig,
    registry: Arc<ConnectionRegistry>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        registry: Arc<ConnectionRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = heartbeat_interval.as_secs(),
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats().await;
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Ping every registered connection in parallel
    async fn send_heartbeats(&self) {
        let connections = self.registry.all_connections();
        let total_count = connections.len();

        if total_count == 0 {
            return;
        }

        let start = Instant::now();
        let failed = Arc::new(AtomicUsize::new(0));
        let timed_out = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = connections
            .into_iter()
            .map(|handle| {
                let failed = failed.clone();
                let timed_out = timed_out.clone();

                async move {
                    let send_timeout = Duration::from_millis(HEARTBEAT_SEND_TIMEOUT_MS);
                    match timeout(send_timeout, handle.ping()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                tenant = ?handle.tenant(),
                                connection_id = %handle.id,
                                "Failed to send ping, connection may be dead"
                            );
                        }
                        Err(_) => {
                            timed_out.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                tenant = ?handle.tenant(),
                                connection_id = %handle.id,
                                timeout_ms = HEARTBEAT_SEND_TIMEOUT_MS,
                                "Ping send timed out"
                            );
                        }
                    }
                }
            })
            .collect();

        join_all(futures).await;

        tracing::debug!(
            total = total_count,
            failed = failed.load(Ordering::Relaxed),
            timed_out = timed_out.load(Ordering::Relaxed),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Heartbeat round completed"
        );
    }
}
