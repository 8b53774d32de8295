use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;

use crate::publish::EventPublisher;

/// Periodically publishes a demo message, until shutdown.
pub struct DemoTicker {
    publisher: Arc<dyn EventPublisher>,
    app_id: String,
    channel: String,
    event: String,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl DemoTicker {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        app_id: String,
        channel: String,
        event: String,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            publisher,
            app_id,
            channel,
            event,
            interval,
            shutdown,
        }
    }

    /// Returns the number of messages published
    pub async fn run(mut self) -> u64 {
        let mut timer = tokio::time::interval(self.interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            channel = %self.channel,
            interval_ms = self.interval.as_millis() as u64,
            "Demo ticker started"
        );

        let mut sequence = 0u64;
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = timer.tick() => {
                    sequence += 1;
                    let payload = json!({
                        "text": format!("Demo message #{}", sequence),
                        "timestamp": Utc::now().to_rfc3339(),
                        "sender": "server",
                    });
                    if let Err(e) = self
                        .publisher
                        .publish(&self.app_id, &self.channel, &self.event, payload)
                        .await
                    {
                        tracing::warn!(error = %e, "Demo publish failed");
                    }
                }
            }
        }

        tracing::info!(published = sequence, "Demo ticker stopped");
        sequence
    }
}
