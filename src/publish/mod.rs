//! Server-side publishing.
//!
//! `EventPublisher` is the narrow interface handed to collaborators that
//! inject events without holding a client connection (the HTTP relay, the
//! demo ticker, the HTTP events endpoint).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::channel::DeliveryResult;
use crate::error::BrokerError;
use crate::router::EventRouter;

/// Inject an event into a channel.
///
/// Publishing to a channel without subscribers succeeds without delivering
/// anything. Fails with `AppNotFound` or `ChannelInvalid`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        app_id: &str,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<DeliveryResult, BrokerError>;
}

/// In-process publisher backed by the event router.
///
/// Server-trusted: no signature check, no client-message flag and no rate
/// limit.
#[derive(Clone)]
pub struct PublishApi {
    router: Arc<EventRouter>,
}

impl PublishApi {
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl EventPublisher for PublishApi {
    async fn publish(
        &self,
        app_id: &str,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<DeliveryResult, BrokerError> {
        self.router
            .route_published_event(app_id, channel, event, payload)
    }
}
