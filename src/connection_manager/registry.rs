use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::stats::ConnectionStats;
use super::types::{ConnectionHandle, SocketId};
use crate::apps::App;
use crate::channel::ChannelManager;
use crate::error::BrokerError;
use crate::websocket::OutboundMessage;

/// Tracks all live connections and enforces per-app connection limits.
///
/// Deregistration also removes the connection from every channel, so a
/// closed connection is never left behind as a subscriber.
pub struct ConnectionRegistry {
    /// socket_id -> ConnectionHandle
    connections: DashMap<SocketId, Arc<ConnectionHandle>>,
    /// app_id -> number of registered connections
    app_counts: DashMap<String, usize>,
    channels: Arc<ChannelManager>,
}

impl ConnectionRegistry {
    pub fn new(channels: Arc<ChannelManager>) -> Self {
        Self {
            connections: DashMap::new(),
            app_counts: DashMap::new(),
            channels,
        }
    }

    /// Register a new connection for an app.
    ///
    /// The limit check and the increment happen under the same entry lock, so
    /// concurrent handshakes can never push an app past `max_connections`.
    pub fn register(
        &self,
        app: &App,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<ConnectionHandle>, BrokerError> {
        let mut count = self.app_counts.entry(app.id.clone()).or_insert(0);
        if app.max_connections > 0 && *count >= app.max_connections {
            tracing::warn!(
                app_id = %app.id,
                current = *count,
                max = app.max_connections,
                "Connection limit reached"
            );
            return Err(BrokerError::CapacityExceeded {
                max: app.max_connections,
            });
        }

        let handle = Arc::new(ConnectionHandle::new(app.id.clone(), sender));
        self.connections.insert(handle.id.clone(), handle.clone());
        *count += 1;
        drop(count);

        tracing::info!(socket_id = %handle.id, app_id = %app.id, "Connection registered");

        Ok(handle)
    }

    /// Remove a connection and all of its subscriptions.
    ///
    /// Idempotent: returns false if the connection was already gone.
    pub async fn deregister(&self, socket_id: &SocketId) -> bool {
        let Some((_, handle)) = self.connections.remove(socket_id) else {
            return false;
        };

        handle.begin_close();
        let channels_left = self.channels.remove_connection(&handle).await;
        handle.mark_closed();

        if let Some(mut count) = self.app_counts.get_mut(&handle.app_id) {
            *count = count.saturating_sub(1);
        }
        self.app_counts.remove_if(&handle.app_id, |_, count| *count == 0);

        tracing::info!(
            socket_id = %socket_id,
            app_id = %handle.app_id,
            channels_left,
            "Connection deregistered"
        );

        true
    }

    pub fn get(&self, socket_id: &SocketId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(socket_id).map(|h| h.clone())
    }

    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn connections_for_app(&self, app_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .filter(|r| r.value().app_id == app_id)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Total number of registered connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn app_connection_count(&self, app_id: &str) -> usize {
        self.app_counts.get(app_id).map(|c| *c).unwrap_or(0)
    }

    /// Connections with no inbound activity for longer than `timeout`
    pub fn stale_connections(&self, timeout: Duration) -> Vec<Arc<ConnectionHandle>> {
        let now = Utc::now();
        let timeout_ms = timeout.as_millis() as i64;
        self.connections
            .iter()
            .filter(|r| r.value().idle_millis(now) > timeout_ms)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn stats(&self) -> ConnectionStats {
        let apps: HashMap<String, usize> = self
            .app_counts
            .iter()
            .map(|r| (r.key().clone(), *r.value()))
            .collect();

        ConnectionStats {
            total_connections: self.connections.len(),
            apps,
            occupied_channels: self.channels.channel_count(),
        }
    }
}
