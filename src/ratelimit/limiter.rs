//! Per-app rate limiting for client events, backend events and read requests

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::token_bucket::TokenBucket;
use crate::apps::App;
use crate::error::BrokerError;

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed {
        /// Tokens left in the current window, `None` when the app is unlimited
        remaining: Option<u32>,
    },
    /// Request is denied until the next window
    Denied { retry_after_ms: u64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    pub fn into_result(self) -> Result<(), BrokerError> {
        match self {
            RateLimitResult::Allowed { .. } => Ok(()),
            RateLimitResult::Denied { retry_after_ms } => {
                Err(BrokerError::RateLimited { retry_after_ms })
            }
        }
    }
}

/// Which per-app budget an operation draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// `client-*` events sent over WebSocket
    ClientEvent,
    /// Events triggered through the HTTP events endpoint
    BackendEvent,
    /// HTTP channel queries
    ReadRequest,
}

impl LimitKind {
    fn capacity(&self, app: &App) -> u32 {
        match self {
            LimitKind::ClientEvent => app.max_client_events_per_second,
            LimitKind::BackendEvent => app.max_backend_events_per_second,
            LimitKind::ReadRequest => app.max_read_requests_per_second,
        }
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub denied: u64,
    pub active_buckets: usize,
}

/// Token buckets keyed by app and budget.
///
/// Buckets are created on first use. A limit of 0 disables limiting for
/// that budget.
pub struct EventRateLimiter {
    buckets: DashMap<(String, LimitKind), Arc<TokenBucket>>,
    window: Duration,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl EventRateLimiter {
    /// Limiter with one-second windows
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            window,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub fn check_client_event(&self, app: &App) -> RateLimitResult {
        self.check(app, LimitKind::ClientEvent)
    }

    pub fn check_backend_event(&self, app: &App) -> RateLimitResult {
        self.check(app, LimitKind::BackendEvent)
    }

    pub fn check_read_request(&self, app: &App) -> RateLimitResult {
        self.check(app, LimitKind::ReadRequest)
    }

    pub fn check(&self, app: &App, kind: LimitKind) -> RateLimitResult {
        self.check_at(app, kind, TokenBucket::now_millis())
    }

    /// Check a budget at an explicit time (milliseconds since the epoch)
    pub fn check_at(&self, app: &App, kind: LimitKind, now_ms: u64) -> RateLimitResult {
        let capacity = kind.capacity(app);
        if capacity == 0 {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return RateLimitResult::Allowed { remaining: None };
        }

        let bucket = self
            .buckets
            .entry((app.id.clone(), kind))
            .or_insert_with(|| Arc::new(TokenBucket::new(capacity, self.window)))
            .clone();

        match bucket.try_consume_at(now_ms) {
            Ok(remaining) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                RateLimitResult::Allowed {
                    remaining: Some(remaining),
                }
            }
            Err(retry_after_ms) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    app_id = %app.id,
                    kind = ?kind,
                    retry_after_ms,
                    "Rate limit exceeded"
                );
                RateLimitResult::Denied { retry_after_ms }
            }
        }
    }

    /// Drop buckets unused for longer than `max_idle`. Returns the number removed.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let now = TokenBucket::now_millis();
        let idle_ms = max_idle.as_millis() as u64;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_idle(now, idle_ms));
        before.saturating_sub(self.buckets.len())
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            active_buckets: self.buckets.len(),
        }
    }
}

impl Default for EventRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
