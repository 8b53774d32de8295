//! Event routing.
//!
//! Accepts events from connections and from the server side and fans them
//! out through the channel manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::apps::AppManager;
use crate::channel::{validate_event_name, ChannelManager, ChannelType, DeliveryResult};
use crate::connection_manager::{ConnectionRegistry, SocketId};
use crate::error::BrokerError;
use crate::ratelimit::EventRateLimiter;
use crate::websocket::ServerMessage;

/// Prefix required on events sent by clients
pub const CLIENT_EVENT_PREFIX: &str = "client-";

/// Statistics for the event router
#[derive(Debug, Default)]
pub struct RouterStats {
    /// Client events accepted
    pub client_events: AtomicU64,
    /// Client events refused (flag, subscription or rate limit)
    pub client_events_rejected: AtomicU64,
    /// Server-published events accepted
    pub published_events: AtomicU64,
    /// Total successful deliveries (connection count)
    pub total_delivered: AtomicU64,
    /// Total failed deliveries
    pub total_failed: AtomicU64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            client_events: self.client_events.load(Ordering::Relaxed),
            client_events_rejected: self.client_events_rejected.load(Ordering::Relaxed),
            published_events: self.published_events.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }

    fn record_delivery(&self, result: &DeliveryResult) {
        self.total_delivered
            .fetch_add(result.delivered as u64, Ordering::Relaxed);
        self.total_failed
            .fetch_add(result.failed as u64, Ordering::Relaxed);
    }
}

/// Snapshot of router statistics
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatsSnapshot {
    pub client_events: u64,
    pub client_events_rejected: u64,
    pub published_events: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
}

pub struct EventRouter {
    apps: Arc<AppManager>,
    registry: Arc<ConnectionRegistry>,
    channels: Arc<ChannelManager>,
    rate_limiter: Arc<EventRateLimiter>,
    stats: RouterStats,
}

impl EventRouter {
    pub fn new(
        apps: Arc<AppManager>,
        registry: Arc<ConnectionRegistry>,
        channels: Arc<ChannelManager>,
        rate_limiter: Arc<EventRateLimiter>,
    ) -> Self {
        Self {
            apps,
            registry,
            channels,
            rate_limiter,
            stats: RouterStats::default(),
        }
    }

    /// Route a `client-*` event sent by a connection to the other subscribers
    /// of the channel.
    ///
    /// Refused with `Forbidden` when the app disables client messages, the
    /// channel is public or the sender is not subscribed to it, and with
    /// `RateLimited` once the app's client event budget is spent.
    #[tracing::instrument(
        name = "router.client_event",
        skip(self, payload),
        fields(socket_id = %socket_id)
    )]
    pub async fn route_client_event(
        &self,
        socket_id: &SocketId,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<DeliveryResult, BrokerError> {
        let result = self.check_client_event(socket_id, channel, event).await;
        let (app_id, user_id) = match result {
            Ok(checked) => checked,
            Err(e) => {
                self.stats
                    .client_events_rejected
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, "Client event rejected");
                return Err(e);
            }
        };

        let message = ServerMessage::channel_event(channel, event, payload, user_id);
        let result = self
            .channels
            .broadcast(&app_id, channel, &message, Some(socket_id));

        self.stats.client_events.fetch_add(1, Ordering::Relaxed);
        self.stats.record_delivery(&result);

        Ok(result)
    }

    /// Validate a client event. Returns the sender's app id and, on presence
    /// channels, its user id.
    async fn check_client_event(
        &self,
        socket_id: &SocketId,
        channel: &str,
        event: &str,
    ) -> Result<(String, Option<String>), BrokerError> {
        let handle = self
            .registry
            .get(socket_id)
            .ok_or_else(|| BrokerError::Forbidden("Connection is not registered".into()))?;
        let app = self
            .apps
            .find_by_id(&handle.app_id)
            .ok_or_else(|| BrokerError::AppNotFound(handle.app_id.clone()))?;

        if !app.enable_client_messages {
            return Err(BrokerError::Forbidden(
                "Client events are not enabled for this app".into(),
            ));
        }
        if !event.starts_with(CLIENT_EVENT_PREFIX) {
            return Err(BrokerError::InvalidMessage(format!(
                "Client event names must start with {}",
                CLIENT_EVENT_PREFIX
            )));
        }
        validate_event_name(event)?;

        let kind = ChannelType::parse(channel)?;
        if kind == ChannelType::Public {
            return Err(BrokerError::Forbidden(
                "Client events are only allowed on private and presence channels".into(),
            ));
        }
        if !handle.is_subscribed(channel).await {
            return Err(BrokerError::Forbidden(format!(
                "Not subscribed to {}",
                channel
            )));
        }

        self.rate_limiter.check_client_event(&app).into_result()?;

        let user_id = match kind {
            ChannelType::Presence => self
                .channels
                .member(&app.id, channel, socket_id)
                .map(|m| m.user_id),
            _ => None,
        };
        Ok((app.id.clone(), user_id))
    }

    /// Route a server-published event to every subscriber of the channel.
    ///
    /// Trusted path: no signature, flag or rate limit checks. A channel with
    /// no subscribers is a successful no-op.
    pub fn route_published_event(
        &self,
        app_id: &str,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<DeliveryResult, BrokerError> {
        if self.apps.find_by_id(app_id).is_none() {
            return Err(BrokerError::AppNotFound(app_id.to_string()));
        }
        ChannelType::parse(channel)?;
        validate_event_name(event)?;

        let message = ServerMessage::channel_event(channel, event, payload, None);
        let result = self.channels.broadcast(app_id, channel, &message, None);

        self.stats.published_events.fetch_add(1, Ordering::Relaxed);
        self.stats.record_delivery(&result);

        tracing::debug!(
            app_id = %app_id,
            channel = %channel,
            event = %event,
            delivered = result.delivered,
            failed = result.failed,
            "Event published"
        );

        Ok(result)
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::App;
    use crate::auth::AuthValidator;
    use crate::channel::AuthPayload;
    use crate::connection_manager::ConnectionHandle;
    use crate::websocket::OutboundMessage;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        app: App,
        channels: Arc<ChannelManager>,
        registry: Arc<ConnectionRegistry>,
        router: EventRouter,
    }

    fn fixture(app: App) -> Fixture {
        let apps = Arc::new(AppManager::new([app.clone()]));
        let channels = Arc::new(ChannelManager::new());
        let registry = Arc::new(ConnectionRegistry::new(channels.clone()));
        let router = EventRouter::new(
            apps,
            registry.clone(),
            channels.clone(),
            Arc::new(EventRateLimiter::new()),
        );
        Fixture { app, channels, registry, router }
    }

    impl Fixture {
        async fn connect(&self) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
            let (tx, rx) = mpsc::channel(16);
            let handle = self.registry.register(&self.app, tx).unwrap();
            handle.mark_open();
            (handle, rx)
        }

        async fn join_private(&self, handle: &Arc<ConnectionHandle>, channel: &str) {
            let auth = AuthPayload {
                auth: AuthValidator::auth_token(
                    &self.app.key,
                    &self.app.secret,
                    handle.id.as_str(),
                    channel,
                    None,
                ),
                channel_data: None,
            };
            self.channels
                .subscribe(&self.app, handle, channel, Some(&auth))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_client_event_reaches_others_only() {
        let f = fixture(App::default());
        let (a, mut rx_a) = f.connect().await;
        let (b, mut rx_b) = f.connect().await;
        f.join_private(&a, "private-chat").await;
        f.join_private(&b, "private-chat").await;

        let result = f
            .router
            .route_client_event(&a.id, "private-chat", "client-typing", json!({"on": true}))
            .await
            .unwrap();
        assert_eq!(result.delivered, 1);

        assert!(rx_a.try_recv().is_err());
        let msg = rx_b.try_recv().unwrap().to_json().unwrap();
        assert!(msg.contains("client-typing"));
        assert_eq!(f.router.stats().client_events, 1);
    }

    #[tokio::test]
    async fn test_client_event_requires_flag() {
        let f = fixture(App {
            enable_client_messages: false,
            ..App::default()
        });
        let (a, _rx) = f.connect().await;
        f.join_private(&a, "private-chat").await;

        let err = f
            .router
            .route_client_event(&a.id, "private-chat", "client-x", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Forbidden(_)));
        assert_eq!(f.router.stats().client_events_rejected, 1);
    }

    #[tokio::test]
    async fn test_client_event_requires_subscription() {
        let f = fixture(App::default());
        let (a, _rx) = f.connect().await;

        let err = f
            .router
            .route_client_event(&a.id, "private-chat", "client-x", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_client_event_refused_on_public_channel() {
        let f = fixture(App::default());
        let (a, _rx) = f.connect().await;
        f.channels.subscribe(&f.app, &a, "news", None).await.unwrap();

        let err = f
            .router
            .route_client_event(&a.id, "news", "client-x", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_client_event_rate_limited() {
        let f = fixture(App {
            max_client_events_per_second: 2,
            ..App::default()
        });
        let (a, _rx) = f.connect().await;
        f.join_private(&a, "private-chat").await;

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(
                f.router
                    .route_client_event(&a.id, "private-chat", "client-x", json!({}))
                    .await,
            );
        }

        // A window boundary can fall between the calls; at most 2 per window
        let limited = outcomes
            .iter()
            .filter(|r| matches!(r, Err(BrokerError::RateLimited { .. })))
            .count();
        assert!(limited <= 1);
        assert!(outcomes.iter().filter(|r| r.is_ok()).count() >= 2);
    }

    #[tokio::test]
    async fn test_presence_client_event_carries_user_id() {
        let f = fixture(App::default());
        let (a, _rx_a) = f.connect().await;
        let (b, mut rx_b) = f.connect().await;

        for (handle, user) in [(&a, "ann"), (&b, "bob")] {
            let data = json!({"user_id": user}).to_string();
            let auth = AuthPayload {
                auth: AuthValidator::auth_token(
                    &f.app.key,
                    &f.app.secret,
                    handle.id.as_str(),
                    "presence-room",
                    Some(&data),
                ),
                channel_data: Some(data),
            };
            f.channels.subscribe(&f.app, handle, "presence-room", Some(&auth)).await.unwrap();
        }
        while rx_b.try_recv().is_ok() {}

        f.router
            .route_client_event(&a.id, "presence-room", "client-wave", json!({}))
            .await
            .unwrap();
        let text = rx_b.try_recv().unwrap().to_json().unwrap();
        let msg: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(msg["user_id"], "ann");
    }

    #[tokio::test]
    async fn test_published_event_semantics() {
        let f = fixture(App::default());
        let (a, mut rx_a) = f.connect().await;
        f.channels.subscribe(&f.app, &a, "news", None).await.unwrap();

        let result = f
            .router
            .route_published_event(&f.app.id, "news", "update", json!({"n": 1}))
            .unwrap();
        assert_eq!(result.delivered, 1);
        assert!(rx_a.try_recv().is_ok());

        // No subscribers: success, nothing delivered
        let result = f
            .router
            .route_published_event(&f.app.id, "empty", "update", json!({}))
            .unwrap();
        assert_eq!(result, DeliveryResult::default());

        assert!(matches!(
            f.router.route_published_event("nope", "news", "e", json!({})),
            Err(BrokerError::AppNotFound(_))
        ));
        assert!(matches!(
            f.router.route_published_event(&f.app.id, "bad channel", "e", json!({})),
            Err(BrokerError::ChannelInvalid(_))
        ));
    }
}
