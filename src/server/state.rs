use std::sync::Arc;
use std::time::Instant;

use crate::apps::AppManager;
use crate::channel::ChannelManager;
use crate::config::Settings;
use crate::connection_manager::ConnectionRegistry;
use crate::publish::{EventPublisher, PublishApi};
use crate::ratelimit::EventRateLimiter;
use crate::router::EventRouter;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub apps: Arc<AppManager>,
    pub channels: Arc<ChannelManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub rate_limiter: Arc<EventRateLimiter>,
    pub router: Arc<EventRouter>,
    pub publisher: Arc<dyn EventPublisher>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let apps = Arc::new(AppManager::new(settings.apps.iter().cloned()));
        let channels = Arc::new(ChannelManager::new());
        let registry = Arc::new(ConnectionRegistry::new(channels.clone()));
        let rate_limiter = Arc::new(EventRateLimiter::new());
        let router = Arc::new(EventRouter::new(
            apps.clone(),
            registry.clone(),
            channels.clone(),
            rate_limiter.clone(),
        ));
        let publisher: Arc<dyn EventPublisher> = Arc::new(PublishApi::new(router.clone()));

        Self {
            settings: Arc::new(settings),
            apps,
            channels,
            registry,
            rate_limiter,
            router,
            publisher,
            started_at: Instant::now(),
        }
    }
}
