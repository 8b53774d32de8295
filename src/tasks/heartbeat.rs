use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::WebSocketConfig;
use crate::connection_manager::{CloseReason, ConnectionRegistry, DeliveryError};
use crate::ratelimit::EventRateLimiter;
use crate::websocket::ServerMessage;

/// Rate limit buckets unused for this long are dropped during cleanup
const RATE_LIMIT_BUCKET_IDLE: Duration = Duration::from_secs(300);

/// Outcome of one heartbeat round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRound {
    pub pinged: usize,
    pub failed: usize,
}

/// Background task for heartbeat and idle connection eviction.
///
/// Connections quiet for longer than `heartbeat_interval` get a
/// `pusher:ping`; connections quiet for longer than `connection_timeout`
/// are closed with code 4201 and deregistered.
pub struct HeartbeatTask {
    config: WebSocketConfig,
    registry: Arc<ConnectionRegistry>,
    rate_limiter: Arc<EventRateLimiter>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        registry: Arc<ConnectionRegistry>,
        rate_limiter: Arc<EventRateLimiter>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            rate_limiter,
            shutdown,
        }
    }

    /// Run the heartbeat and cleanup tasks
    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval.max(1));

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = self.config.connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats();
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup_stale_connections().await;
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Ping every connection that has been quiet for a heartbeat interval
    pub fn send_heartbeats(&self) -> HeartbeatRound {
        let now = Utc::now();
        let idle_threshold_ms = (self.config.heartbeat_interval * 1000) as i64;
        let mut round = HeartbeatRound::default();

        for handle in self.registry.all() {
            if handle.idle_millis(now) < idle_threshold_ms {
                continue;
            }
            match handle.send(ServerMessage::ping()) {
                Ok(()) => round.pinged += 1,
                Err(DeliveryError::Overflow) | Err(DeliveryError::Closed) => {
                    round.failed += 1;
                    tracing::debug!(
                        socket_id = %handle.id,
                        "Failed to send heartbeat, connection may be dead"
                    );
                }
            }
        }

        if round.pinged > 0 || round.failed > 0 {
            tracing::debug!(
                pinged = round.pinged,
                failed = round.failed,
                "Heartbeat round completed"
            );
        }

        round
    }

    /// Evict connections idle past the connection timeout. Returns the number evicted.
    pub async fn cleanup_stale_connections(&self) -> usize {
        let timeout = Duration::from_secs(self.config.connection_timeout);
        let stale = self.registry.stale_connections(timeout);

        let mut removed = 0;
        for handle in stale {
            handle.close(CloseReason::ActivityTimeout);
            if self.registry.deregister(&handle.id).await {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(
                removed = removed,
                timeout_secs = self.config.connection_timeout,
                "Cleaned up stale connections"
            );
        }

        let buckets = self.rate_limiter.cleanup_idle(RATE_LIMIT_BUCKET_IDLE);
        if buckets > 0 {
            tracing::debug!(buckets, "Dropped idle rate limit buckets");
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::App;
    use crate::channel::ChannelManager;
    use crate::connection_manager::ConnectionState;
    use crate::websocket::OutboundMessage;
    use tokio::sync::mpsc;

    fn task(
        config: WebSocketConfig,
    ) -> (HeartbeatTask, Arc<ConnectionRegistry>, broadcast::Sender<()>) {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(ChannelManager::new())));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = HeartbeatTask::new(
            config,
            registry.clone(),
            Arc::new(EventRateLimiter::new()),
            shutdown_rx,
        );
        (task, registry, shutdown_tx)
    }

    #[tokio::test]
    async fn test_heartbeat_task_shutdown() {
        let (task, _, shutdown_tx) = task(WebSocketConfig::default());

        // Spawn the task
        let handle = tokio::spawn(async move {
            task.run().await;
        });

        // Wait a bit then send shutdown
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        // Task should complete
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }

    #[tokio::test]
    async fn test_heartbeat_pings_idle_connections() {
        let (task, registry, _shutdown) = task(WebSocketConfig {
            heartbeat_interval: 0,
            ..Default::default()
        });

        let (tx, mut rx) = mpsc::channel::<OutboundMessage>(10);
        let handle = registry.register(&App::default(), tx).unwrap();
        handle.mark_open();

        assert_eq!(task.send_heartbeats(), HeartbeatRound { pinged: 1, failed: 0 });
        let msg = rx.try_recv().expect("Should receive heartbeat");
        assert!(matches!(msg, OutboundMessage::Raw(ref m) if m.event == "pusher:ping"));
    }

    #[tokio::test]
    async fn test_recently_active_connection_not_pinged() {
        let (task, registry, _shutdown) = task(WebSocketConfig {
            heartbeat_interval: 3600,
            ..Default::default()
        });

        let (tx, mut rx) = mpsc::channel::<OutboundMessage>(10);
        registry.register(&App::default(), tx).unwrap().mark_open();

        assert_eq!(task.send_heartbeats(), HeartbeatRound::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cleanup_evicts_stale_connections() {
        let (task, registry, _shutdown) = task(WebSocketConfig {
            connection_timeout: 0,
            ..Default::default()
        });

        let (tx, _rx) = mpsc::channel::<OutboundMessage>(10);
        let handle = registry.register(&App::default(), tx).unwrap();
        handle.mark_open();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(task.cleanup_stale_connections().await, 1);
        assert_eq!(registry.count(), 0);
        assert_eq!(handle.close_reason(), Some(CloseReason::ActivityTimeout));
        assert_eq!(handle.state(), ConnectionState::Closed);
    }
}
