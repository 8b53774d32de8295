use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};

use super::channels::{get_channel, get_channel_users, list_channels};
use super::events::trigger_event;
use super::health::{health, stats};

pub fn api_routes(state: AppState) -> Router<AppState> {
    let apps = Router::new()
        .route("/apps/{app_id}/events", post(trigger_event))
        .route("/apps/{app_id}/channels", get(list_channels))
        .route("/apps/{app_id}/channels/{channel}", get(get_channel))
        .route(
            "/apps/{app_id}/channels/{channel}/users",
            get(get_channel_users),
        )
        .route_layer(middleware::from_fn_with_state(state, api_key_auth));

    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .merge(apps)
}
