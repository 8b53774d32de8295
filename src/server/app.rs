use axum::{http::HeaderValue, routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::api::api_routes;
use crate::relay::{relay_routes, RelayState};
use crate::websocket::ws_handler;

use super::AppState;

/// Maximum accepted HTTP request body
const MAX_REQUEST_BODY: usize = 100 * 1024;

pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.server.cors_origins);

    let mut app = Router::new()
        // WebSocket endpoint
        .route("/app/{key}", get(ws_handler))
        // Merge API routes
        .merge(api_routes(state.clone()))
        .with_state(state.clone());

    match RelayState::from_app_state(&state) {
        Some(relay) => app = app.merge(relay_routes(relay)),
        None => tracing::info!("Relay routes disabled"),
    }

    app.layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// CORS: any origin unless an explicit list is configured
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
}
