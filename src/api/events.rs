//! HTTP event trigger, for backends publishing over the network.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::{validate_event_name, ChannelType};
use crate::error::{AppError, BrokerError};
use crate::server::AppState;

/// Maximum number of channels a single trigger may target
const MAX_TRIGGER_CHANNELS: usize = 100;

#[derive(Debug, Deserialize)]
pub struct TriggerEventRequest {
    pub name: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub data: Value,
}

impl TriggerEventRequest {
    fn target_channels(&self) -> Result<Vec<String>, AppError> {
        let channels = match (&self.channel, &self.channels) {
            (Some(channel), None) => vec![channel.clone()],
            (None, Some(channels)) => channels.clone(),
            (Some(_), Some(_)) => {
                return Err(AppError::Validation(
                    "Specify either channel or channels, not both".into(),
                ))
            }
            (None, None) => {
                return Err(AppError::Validation("Missing channel or channels".into()))
            }
        };

        if channels.is_empty() || channels.len() > MAX_TRIGGER_CHANNELS {
            return Err(AppError::Validation(format!(
                "Between 1 and {} channels are required",
                MAX_TRIGGER_CHANNELS
            )));
        }

        // Reject the whole batch before anything is delivered
        validate_event_name(&self.name)?;
        for channel in &channels {
            ChannelType::parse(channel)?;
        }
        Ok(channels)
    }
}

#[derive(Debug, Serialize)]
pub struct TriggerEventResponse {
    pub channels: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// POST /apps/{app_id}/events - Publish an event to one or more channels
pub async fn trigger_event(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Json(request): Json<TriggerEventRequest>,
) -> Result<Json<TriggerEventResponse>, AppError> {
    let app = state
        .apps
        .find_by_id(&app_id)
        .ok_or_else(|| BrokerError::AppNotFound(app_id.clone()))?;
    let channels = request.target_channels()?;
    state.rate_limiter.check_backend_event(&app).into_result()?;

    let mut response = TriggerEventResponse {
        channels: channels.len(),
        delivered: 0,
        failed: 0,
    };

    for channel in &channels {
        let result = state
            .publisher
            .publish(&app.id, channel, &request.name, request.data.clone())
            .await?;
        response.delivered += result.delivered;
        response.failed += result.failed;
    }

    tracing::info!(
        app_id = %app.id,
        event = %request.name,
        channels = response.channels,
        delivered = response.delivered,
        "Event triggered over HTTP"
    );

    Ok(Json(response))
}
