//! Channel query endpoints, limited by the app's read request budget.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::apps::App;
use crate::channel::{ChannelType, PRESENCE_PREFIX};
use crate::error::{AppError, BrokerError};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct ChannelsQuery {
    pub filter_by_prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChannelSummary {
    pub subscription_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ChannelListResponse {
    pub channels: BTreeMap<String, ChannelSummary>,
}

#[derive(Debug, Serialize)]
pub struct ChannelDetailResponse {
    pub occupied: bool,
    pub subscription_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ChannelUser {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct ChannelUsersResponse {
    pub users: Vec<ChannelUser>,
}

/// Resolve the app and charge one read request against its budget
fn read_app(state: &AppState, app_id: &str) -> Result<Arc<App>, AppError> {
    let app = state
        .apps
        .find_by_id(app_id)
        .ok_or_else(|| BrokerError::AppNotFound(app_id.to_string()))?;
    state.rate_limiter.check_read_request(&app).into_result()?;
    Ok(app)
}

/// GET /apps/{app_id}/channels - Occupied channels, optionally filtered by prefix
pub async fn list_channels(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Query(query): Query<ChannelsQuery>,
) -> Result<Json<ChannelListResponse>, AppError> {
    let app = read_app(&state, &app_id)?;
    let prefix = query.filter_by_prefix.unwrap_or_default();
    // User counts are only reported when listing presence channels
    let with_users = prefix.starts_with(PRESENCE_PREFIX);

    let channels = state
        .channels
        .channels_for_app(&app.id)
        .into_iter()
        .filter(|info| info.name.starts_with(&prefix))
        .map(|info| {
            let summary = ChannelSummary {
                subscription_count: info.subscriber_count,
                user_count: info.user_count.filter(|_| with_users),
            };
            (info.name, summary)
        })
        .collect();

    Ok(Json(ChannelListResponse { channels }))
}

/// GET /apps/{app_id}/channels/{channel} - State of one channel
pub async fn get_channel(
    State(state): State<AppState>,
    Path((app_id, channel)): Path<(String, String)>,
) -> Result<Json<ChannelDetailResponse>, AppError> {
    let app = read_app(&state, &app_id)?;
    ChannelType::parse(&channel)?;

    let response = match state.channels.channel_info(&app.id, &channel) {
        Some(info) => ChannelDetailResponse {
            occupied: info.subscriber_count > 0,
            subscription_count: info.subscriber_count,
            user_count: info.user_count,
        },
        None => ChannelDetailResponse {
            occupied: false,
            subscription_count: 0,
            user_count: None,
        },
    };

    Ok(Json(response))
}

/// GET /apps/{app_id}/channels/{channel}/users - Users on a presence channel
pub async fn get_channel_users(
    State(state): State<AppState>,
    Path((app_id, channel)): Path<(String, String)>,
) -> Result<Json<ChannelUsersResponse>, AppError> {
    let app = read_app(&state, &app_id)?;
    if ChannelType::parse(&channel)? != ChannelType::Presence {
        return Err(AppError::Validation(format!(
            "{} is not a presence channel",
            channel
        )));
    }

    let users = state
        .channels
        .presence_roster(&app.id, &channel)
        .map(|roster| roster.ids.into_iter().map(|id| ChannelUser { id }).collect())
        .unwrap_or_default();

    Ok(Json(ChannelUsersResponse { users }))
}
