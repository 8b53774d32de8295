//! Channels and their subscribers.
//!
//! Channel names carry their type in a prefix: `private-` and `presence-`
//! channels need a signed subscription, anything else is public. Presence
//! channels additionally keep a roster of the users behind the connections.

mod manager;
mod types;

pub use manager::{
    AuthPayload, ChannelInfo, ChannelManager, ChannelMembers, DeliveryResult, SubscriptionResult,
};
pub use types::{
    validate_event_name, ChannelType, PresenceMember, PresenceRoster, MAX_CHANNEL_NAME_LEN,
    MAX_EVENT_NAME_LEN, PRESENCE_PREFIX, PRIVATE_PREFIX,
};
