//! Chat relay.
//!
//! Accepts chat messages over HTTP and republishes them on a fixed channel.
//! The relay only knows the broker through an `EventPublisher`, handed to it
//! at startup.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::is_production;
use crate::publish::EventPublisher;
use crate::server::AppState;

#[derive(Clone)]
pub struct RelayState {
    pub publisher: Arc<dyn EventPublisher>,
    pub app_id: String,
    pub channel: String,
    pub event: String,
    pub host: String,
    pub port: u16,
    pub started_at: Instant,
}

impl RelayState {
    /// Relay configuration from the server state.
    /// Returns `None` when the relay is disabled or its app does not exist.
    pub fn from_app_state(state: &AppState) -> Option<Self> {
        let settings = &state.settings;
        if !settings.relay.enabled {
            return None;
        }

        let app_id = settings.relay_app_id()?;
        if state.apps.find_by_id(&app_id).is_none() {
            tracing::warn!(app_id = %app_id, "Relay app is not configured");
            return None;
        }

        Some(Self {
            publisher: state.publisher.clone(),
            app_id,
            channel: settings.relay.channel.clone(),
            event: settings.relay.event.clone(),
            host: settings.server.host.clone(),
            port: settings.server.port,
            started_at: state.started_at,
        })
    }
}

/// Incoming chat message. Every field is required and must be truthy.
#[derive(Debug, Deserialize)]
pub struct RelayMessage {
    #[serde(default)]
    pub text: Value,
    #[serde(default)]
    pub timestamp: Value,
    #[serde(default)]
    pub sender: Value,
}

impl RelayMessage {
    fn is_complete(&self) -> bool {
        [&self.text, &self.timestamp, &self.sender]
            .into_iter()
            .all(is_truthy)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn relay_routes(state: RelayState) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/api/health", get(health))
        .route("/api/message", post(relay_message))
        .with_state(state)
}

/// GET / - Service status
async fn status(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "port": state.port,
        "host": state.host,
        "environment": if is_production() { "production" } else { "development" },
        "websocket": "available",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// GET /api/health - Liveness with uptime
async fn health(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// POST /api/message - Republish a chat message on the relay channel
async fn relay_message(
    State(state): State<RelayState>,
    Json(message): Json<RelayMessage>,
) -> (StatusCode, Json<Value>) {
    if !message.is_complete() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "Missing required fields: text, timestamp, sender",
            })),
        );
    }

    tracing::info!(sender = %message.sender, "Relaying message");

    let payload = json!({
        "text": message.text,
        "timestamp": message.timestamp,
        "sender": message.sender,
    });

    match state
        .publisher
        .publish(&state.app_id, &state.channel, &state.event, payload)
        .await
    {
        Ok(result) => {
            tracing::info!(delivered = result.delivered, "Message relayed");
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to relay message");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}
