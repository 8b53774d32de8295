use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrokerError;

pub const PRIVATE_PREFIX: &str = "private-";
pub const PRESENCE_PREFIX: &str = "presence-";

/// Maximum channel name length accepted by Pusher
pub const MAX_CHANNEL_NAME_LEN: usize = 200;

/// Maximum event name length
pub const MAX_EVENT_NAME_LEN: usize = 200;

/// Channel type, derived from the name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Public,
    Private,
    Presence,
}

impl ChannelType {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(PRESENCE_PREFIX) {
            ChannelType::Presence
        } else if name.starts_with(PRIVATE_PREFIX) {
            ChannelType::Private
        } else {
            ChannelType::Public
        }
    }

    /// Validate a channel name and return its type
    pub fn parse(name: &str) -> Result<Self, BrokerError> {
        if !is_valid_channel_name(name) {
            return Err(BrokerError::ChannelInvalid(name.to_string()));
        }
        Ok(Self::from_name(name))
    }

    /// Private and presence channels need a signed subscription
    pub fn requires_auth(&self) -> bool {
        !matches!(self, ChannelType::Public)
    }
}

/// Validate channel name
fn is_valid_channel_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_CHANNEL_NAME_LEN {
        return false;
    }

    // A bare type prefix names no channel
    if name == PRIVATE_PREFIX || name == PRESENCE_PREFIX {
        return false;
    }

    name.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '@' | ',' | '.' | ';')
    })
}

/// Validate an event name
pub fn validate_event_name(name: &str) -> Result<(), BrokerError> {
    if name.is_empty() || name.len() > MAX_EVENT_NAME_LEN {
        return Err(BrokerError::InvalidMessage(format!(
            "Event name must be 1-{} characters",
            MAX_EVENT_NAME_LEN
        )));
    }
    Ok(())
}

/// A presence channel member, as supplied in the signed `channel_data`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceMember {
    pub user_id: String,
    pub user_info: Value,
}

#[derive(Deserialize)]
struct RawChannelData {
    user_id: Value,
    #[serde(default)]
    user_info: Value,
}

impl PresenceMember {
    /// Parse `channel_data`. `user_id` may be a string or a number.
    pub fn from_channel_data(channel_data: &str) -> Result<Self, BrokerError> {
        let raw: RawChannelData = serde_json::from_str(channel_data)
            .map_err(|e| BrokerError::InvalidMessage(format!("Invalid channel_data: {}", e)))?;

        let user_id = match raw.user_id {
            Value::String(s) if !s.is_empty() => s,
            Value::Number(n) => n.to_string(),
            _ => {
                return Err(BrokerError::InvalidMessage(
                    "channel_data.user_id must be a non-empty string or a number".into(),
                ))
            }
        };

        Ok(Self {
            user_id,
            user_info: raw.user_info,
        })
    }
}

/// Presence roster sent with `subscription_succeeded`, deduplicated by user
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PresenceRoster {
    pub ids: Vec<String>,
    pub hash: BTreeMap<String, Value>,
    pub count: usize,
}

impl PresenceRoster {
    /// Roster keyed by user id; a user listed more than once keeps its first entry
    pub fn from_members<'a>(members: impl IntoIterator<Item = &'a PresenceMember>) -> Self {
        let mut hash = BTreeMap::new();
        for member in members {
            hash.entry(member.user_id.clone())
                .or_insert_with(|| member.user_info.clone());
        }
        let ids: Vec<String> = hash.keys().cloned().collect();
        Self {
            count: ids.len(),
            ids,
            hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_types() {
        assert_eq!(ChannelType::parse("orders").unwrap(), ChannelType::Public);
        assert_eq!(ChannelType::parse("private-orders").unwrap(), ChannelType::Private);
        assert_eq!(ChannelType::parse("presence-room").unwrap(), ChannelType::Presence);
        assert_eq!(
            ChannelType::parse("private-encrypted-x").unwrap(),
            ChannelType::Private
        );
        assert!(ChannelType::Private.requires_auth());
        assert!(!ChannelType::Public.requires_auth());
    }

    #[test]
    fn test_valid_channel_names() {
        assert!(is_valid_channel_name("orders"));
        assert!(is_valid_channel_name("system-alerts"));
        assert!(is_valid_channel_name("user_notifications"));
        assert!(is_valid_channel_name("v1.events"));
        assert!(is_valid_channel_name("a=b@c,d;e"));
        assert!(is_valid_channel_name(&"a".repeat(200)));
    }

    #[test]
    fn test_invalid_channel_names() {
        assert!(!is_valid_channel_name(""));
        assert!(!is_valid_channel_name("channel with spaces"));
        assert!(!is_valid_channel_name("channel/path"));
        assert!(!is_valid_channel_name("#server-to-user"));
        assert!(!is_valid_channel_name("private-"));
        assert!(!is_valid_channel_name("presence-"));
        assert!(!is_valid_channel_name(&"a".repeat(201)));
        assert!(matches!(
            ChannelType::parse("bad name"),
            Err(BrokerError::ChannelInvalid(_))
        ));
    }

    #[test]
    fn test_event_names() {
        assert!(validate_event_name("new-message").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name(&"e".repeat(201)).is_err());
    }

    #[test]
    fn test_presence_member_parsing() {
        let member =
            PresenceMember::from_channel_data(r#"{"user_id":"u1","user_info":{"name":"Ann"}}"#)
                .unwrap();
        assert_eq!(member.user_id, "u1");
        assert_eq!(member.user_info, json!({"name": "Ann"}));

        let member = PresenceMember::from_channel_data(r#"{"user_id":42}"#).unwrap();
        assert_eq!(member.user_id, "42");
        assert_eq!(member.user_info, Value::Null);

        assert!(PresenceMember::from_channel_data(r#"{"user_id":""}"#).is_err());
        assert!(PresenceMember::from_channel_data(r#"{"user_info":{}}"#).is_err());
        assert!(PresenceMember::from_channel_data("nope").is_err());
    }

    #[test]
    fn test_roster_deduplicates_users() {
        let a = PresenceMember { user_id: "a".into(), user_info: json!(1) };
        let b = PresenceMember { user_id: "b".into(), user_info: json!(2) };
        let a2 = PresenceMember { user_id: "a".into(), user_info: json!(3) };

        let roster = PresenceRoster::from_members([&a, &b, &a2]);
        assert_eq!(roster.count, 2);
        assert_eq!(roster.ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(roster.hash["a"], json!(1));
    }
}
