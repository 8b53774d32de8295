use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::channel::{PresenceMember, PresenceRoster};
use crate::error::BrokerError;

/// Raw inbound frame as sent by Pusher clients
#[derive(Debug, Clone, Deserialize)]
pub struct PusherFrame {
    pub event: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Payload of `pusher:subscribe`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscribeData {
    pub channel: String,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub channel_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeData {
    channel: String,
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe(SubscribeData),
    Unsubscribe { channel: String },
    Ping,
    Pong,
    ClientEvent {
        channel: String,
        event: String,
        data: Value,
    },
}

impl ClientMessage {
    /// Parse a text frame. Unknown or malformed frames yield `InvalidMessage`.
    pub fn parse(text: &str) -> Result<Self, BrokerError> {
        let frame: PusherFrame = serde_json::from_str(text)
            .map_err(|e| BrokerError::InvalidMessage(format!("Invalid JSON: {}", e)))?;

        match frame.event.as_str() {
            "pusher:subscribe" => {
                let data: SubscribeData = decode_data(frame.data)?;
                Ok(ClientMessage::Subscribe(data))
            }
            "pusher:unsubscribe" => {
                let data: UnsubscribeData = decode_data(frame.data)?;
                Ok(ClientMessage::Unsubscribe {
                    channel: data.channel,
                })
            }
            "pusher:ping" => Ok(ClientMessage::Ping),
            "pusher:pong" => Ok(ClientMessage::Pong),
            event if event.starts_with("client-") => {
                let channel = frame.channel.ok_or_else(|| {
                    BrokerError::InvalidMessage("Client event is missing a channel".into())
                })?;
                Ok(ClientMessage::ClientEvent {
                    channel,
                    event: frame.event,
                    data: frame.data.unwrap_or(Value::Null),
                })
            }
            other => Err(BrokerError::InvalidMessage(format!("Unsupported event: {}", other))),
        }
    }
}

/// `data` of protocol events may arrive either as an object or as a JSON-encoded string
fn decode_data<T: serde::de::DeserializeOwned>(data: Option<Value>) -> Result<T, BrokerError> {
    let value = match data {
        Some(Value::String(s)) => serde_json::from_str(&s)
            .map_err(|e| BrokerError::InvalidMessage(format!("Invalid data: {}", e)))?,
        Some(v) => v,
        None => return Err(BrokerError::InvalidMessage("Missing data".into())),
    };
    serde_json::from_value(value)
        .map_err(|e| BrokerError::InvalidMessage(format!("Invalid data: {}", e)))
}

/// Messages sent from server to client, in Pusher wire format
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ServerMessage {
    fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            channel: None,
            data: None,
            user_id: None,
        }
    }

    fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Pusher encodes the data of these events as a JSON string
    fn with_encoded_data(self, data: Value) -> Self {
        self.with_data(Value::String(data.to_string()))
    }

    pub fn connection_established(socket_id: &str, activity_timeout: u64) -> Self {
        Self::new("pusher:connection_established").with_encoded_data(json!({
            "socket_id": socket_id,
            "activity_timeout": activity_timeout,
        }))
    }

    pub fn ping() -> Self {
        Self::new("pusher:ping").with_data(json!({}))
    }

    pub fn pong() -> Self {
        Self::new("pusher:pong").with_data(json!({}))
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::new("pusher:error").with_data(json!({
            "code": code,
            "message": message.into(),
        }))
    }

    pub fn from_error(err: &BrokerError) -> Self {
        Self::error(err.code(), err.to_string())
    }

    pub fn subscription_succeeded(channel: &str, roster: Option<&PresenceRoster>) -> Self {
        let data = match roster {
            Some(roster) => json!({ "presence": roster }),
            None => json!({}),
        };
        Self::new("pusher_internal:subscription_succeeded")
            .on_channel(channel)
            .with_encoded_data(data)
    }

    pub fn subscription_error(channel: &str, err: &BrokerError) -> Self {
        let status = match err {
            BrokerError::AuthFailed(_) => 401,
            BrokerError::RateLimited { .. } => 429,
            BrokerError::Forbidden(_) => 403,
            _ => 400,
        };
        Self::new("pusher:subscription_error")
            .on_channel(channel)
            .with_data(json!({
                "type": err.kind(),
                "error": err.to_string(),
                "status": status,
            }))
    }

    pub fn member_added(channel: &str, member: &PresenceMember) -> Self {
        Self::new("pusher_internal:member_added")
            .on_channel(channel)
            .with_encoded_data(json!({
                "user_id": member.user_id,
                "user_info": member.user_info,
            }))
    }

    pub fn member_removed(channel: &str, user_id: &str) -> Self {
        Self::new("pusher_internal:member_removed")
            .on_channel(channel)
            .with_encoded_data(json!({ "user_id": user_id }))
    }

    /// An application event delivered on a channel.
    /// Non-string payloads are JSON-encoded into the `data` string.
    pub fn channel_event(
        channel: &str,
        event: &str,
        payload: Value,
        user_id: Option<String>,
    ) -> Self {
        let data = match payload {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let mut message = Self::new(event)
            .on_channel(channel)
            .with_data(Value::String(data));
        message.user_id = user_id;
        message
    }
}

/// Message queued on a connection's outbound channel.
///
/// Fan-out serializes the message once and shares the text between all
/// recipients.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Raw(ServerMessage),
    Preserialized(Arc<str>),
}

impl OutboundMessage {
    pub fn preserialized(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        let text = serde_json::to_string(message)?;
        Ok(Self::Preserialized(Arc::from(text)))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            OutboundMessage::Raw(message) => serde_json::to_string(message),
            OutboundMessage::Preserialized(text) => Ok(text.to_string()),
        }
    }
}

impl From<ServerMessage> for OutboundMessage {
    fn from(message: ServerMessage) -> Self {
        OutboundMessage::Raw(message)
    }
}
