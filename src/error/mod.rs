use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors produced by the broker core.
///
/// Every variant is recoverable at the level of a single connection or request:
/// it is reported back to the originator and never affects other connections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Application is over connection quota ({max} connections)")]
    CapacityExceeded { max: usize },

    #[error("Invalid signature for channel {0}")]
    AuthFailed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("Invalid channel name: {0}")]
    ChannelInvalid(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl BrokerError {
    /// Pusher protocol error code reported in `pusher:error` frames.
    pub fn code(&self) -> u16 {
        match self {
            BrokerError::AppNotFound(_) => 4001,
            BrokerError::AuthFailed(_) => 4009,
            BrokerError::CapacityExceeded { .. } => 4100,
            BrokerError::InvalidMessage(_) => 4300,
            BrokerError::RateLimited { .. } => 4301,
            BrokerError::Forbidden(_) | BrokerError::ChannelInvalid(_) => 4302,
        }
    }

    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::CapacityExceeded { .. } => "CapacityExceeded",
            BrokerError::AuthFailed(_) => "AuthError",
            BrokerError::Forbidden(_) => "Forbidden",
            BrokerError::RateLimited { .. } => "RateLimited",
            BrokerError::AppNotFound(_) => "AppNotFound",
            BrokerError::ChannelInvalid(_) => "ChannelInvalid",
            BrokerError::InvalidMessage(_) => "InvalidMessage",
        }
    }
}

/// Errors returned by the HTTP surface
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
pub(crate) fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

fn broker_status(err: &BrokerError) -> (StatusCode, &'static str) {
    match err {
        BrokerError::CapacityExceeded { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "CAPACITY_EXCEEDED")
        }
        BrokerError::AuthFailed(_) => (StatusCode::UNAUTHORIZED, "AUTH_FAILED"),
        BrokerError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        BrokerError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
        BrokerError::AppNotFound(_) => (StatusCode::NOT_FOUND, "APP_NOT_FOUND"),
        BrokerError::ChannelInvalid(_) => (StatusCode::BAD_REQUEST, "CHANNEL_INVALID"),
        BrokerError::InvalidMessage(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Broker(e) => {
                let (status, code) = broker_status(e);
                (status, code, e.to_string())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        };

        if status.is_server_error() {
            tracing::error!(
                code = %code,
                status = %status.as_u16(),
                message = %message,
                "API error"
            );
        } else {
            tracing::warn!(
                code = %code,
                status = %status.as_u16(),
                message = %message,
                "API request rejected"
            );
        }

        let mut response = (
            status,
            Json(ErrorResponse {
                error: ErrorBody {
                    code: code.to_string(),
                    message,
                },
            }),
        )
            .into_response();

        if let AppError::Broker(BrokerError::RateLimited { retry_after_ms }) = &self {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(v) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", v);
            }
        }

        response
    }
}
