use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::apps::App;
use crate::auth::AuthValidator;
use crate::connection_manager::{ConnectionHandle, DeliveryError, SocketId};
use crate::error::BrokerError;
use crate::websocket::{OutboundMessage, ServerMessage};

use super::types::{ChannelType, PresenceMember, PresenceRoster};

/// Threshold for using pre-serialization (saves serialization overhead for larger sends)
const PRESERIALIZATION_THRESHOLD: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChannelKey {
    app_id: String,
    name: String,
}

impl ChannelKey {
    fn new(app_id: &str, name: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            name: name.to_string(),
        }
    }
}

/// A user present on a channel through one or more sockets
struct PresenceUser {
    /// Payload of the first socket that joined
    member: PresenceMember,
    sockets: usize,
}

struct ChannelState {
    kind: ChannelType,
    subscribers: HashMap<SocketId, Arc<ConnectionHandle>>,
    /// Presence channels only
    members: HashMap<SocketId, PresenceMember>,
    /// Presence channels only, keyed by user_id
    users: BTreeMap<String, PresenceUser>,
}

impl ChannelState {
    fn new(kind: ChannelType) -> Self {
        Self {
            kind,
            subscribers: HashMap::new(),
            members: HashMap::new(),
            users: BTreeMap::new(),
        }
    }

    /// Record a presence member. Returns true when the user was not present yet.
    fn add_member(&mut self, socket_id: SocketId, member: PresenceMember) -> bool {
        let joined = match self.users.get_mut(&member.user_id) {
            Some(user) => {
                user.sockets += 1;
                false
            }
            None => {
                self.users.insert(
                    member.user_id.clone(),
                    PresenceUser {
                        member: member.clone(),
                        sockets: 1,
                    },
                );
                true
            }
        };
        self.members.insert(socket_id, member);
        joined
    }

    /// Drop a presence member. Returns the user_id when its last socket left.
    fn remove_member(&mut self, socket_id: &SocketId) -> Option<String> {
        let member = self.members.remove(socket_id)?;
        let user = self.users.get_mut(&member.user_id)?;
        user.sockets = user.sockets.saturating_sub(1);
        if user.sockets > 0 {
            return None;
        }
        self.users.remove(&member.user_id);
        Some(member.user_id)
    }

    fn roster(&self) -> PresenceRoster {
        PresenceRoster::from_members(self.users.values().map(|user| &user.member))
    }

    fn user_count(&self) -> Option<usize> {
        (self.kind == ChannelType::Presence).then(|| self.users.len())
    }
}

/// Signed subscription data for private and presence channels
#[derive(Debug, Clone, PartialEq)]
pub struct AuthPayload {
    /// `"<app key>:<hex signature>"`
    pub auth: String,
    /// Presence member JSON, covered by the signature
    pub channel_data: Option<String>,
}

/// Outcome of a successful subscribe
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionResult {
    pub channel: String,
    pub channel_type: ChannelType,
    /// False when the connection was already subscribed
    pub newly_subscribed: bool,
    pub subscriber_count: usize,
    /// Presence channels only
    pub roster: Option<PresenceRoster>,
}

/// Result of a fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    /// Connections the message was queued for
    pub delivered: usize,
    /// Connections that were gone or had to be disconnected for being too slow
    pub failed: usize,
}

/// Subscribers of a channel, as returned by `members_of`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelMembers {
    pub connections: HashSet<SocketId>,
    /// Presence payload per connection (empty for public and private channels)
    pub users: HashMap<SocketId, PresenceMember>,
}

/// Channel information
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub channel_type: ChannelType,
    pub subscriber_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_count: Option<usize>,
}

type Announcement = (Vec<Arc<ConnectionHandle>>, ServerMessage);

/// Maps channels to their subscribers.
///
/// Channel entries live in a sharded map: mutations of one channel are
/// exclusive, unrelated channels proceed in parallel. A connection's own
/// subscription set is write-locked while its channel entries change, so the
/// two views always agree. No lock is held while messages are delivered.
pub struct ChannelManager {
    channels: DashMap<ChannelKey, ChannelState>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// Private and presence channels require a valid signature. On presence
    /// channels the first connection of a user announces `member_added` to the
    /// existing subscribers.
    #[tracing::instrument(
        name = "channel.subscribe",
        skip(self, app, handle, auth),
        fields(socket_id = %handle.id, app_id = %app.id)
    )]
    pub async fn subscribe(
        &self,
        app: &App,
        handle: &Arc<ConnectionHandle>,
        channel: &str,
        auth: Option<&AuthPayload>,
    ) -> Result<SubscriptionResult, BrokerError> {
        let kind = ChannelType::parse(channel)?;
        let member = if kind.requires_auth() {
            Self::authorize(app, handle, channel, kind, auth)?
        } else {
            None
        };

        let mut subscriptions = handle.subscriptions.write().await;
        if !handle.is_live() {
            return Err(BrokerError::Forbidden("Connection is closing".into()));
        }
        let newly_subscribed = !subscriptions.contains(channel);

        let (result, announcement) = {
            let mut entry = self
                .channels
                .entry(ChannelKey::new(&handle.app_id, channel))
                .or_insert_with(|| ChannelState::new(kind));
            let state = entry.value_mut();

            let mut announcement: Option<Announcement> = None;
            if newly_subscribed {
                if let Some(member) = member {
                    let message = ServerMessage::member_added(channel, &member);
                    if state.add_member(handle.id.clone(), member) {
                        let recipients = state.subscribers.values().cloned().collect();
                        announcement = Some((recipients, message));
                    }
                }
                state.subscribers.insert(handle.id.clone(), handle.clone());
            }

            let result = SubscriptionResult {
                channel: channel.to_string(),
                channel_type: kind,
                newly_subscribed,
                subscriber_count: state.subscribers.len(),
                roster: (kind == ChannelType::Presence).then(|| state.roster()),
            };
            (result, announcement)
        };

        if newly_subscribed {
            subscriptions.insert(channel.to_string());
        }
        drop(subscriptions);

        if let Some((recipients, message)) = announcement {
            Self::deliver(&recipients, &message);
        }

        tracing::debug!(
            channel = %channel,
            subscribers = result.subscriber_count,
            newly_subscribed = result.newly_subscribed,
            "Subscribed to channel"
        );

        Ok(result)
    }

    fn authorize(
        app: &App,
        handle: &ConnectionHandle,
        channel: &str,
        kind: ChannelType,
        auth: Option<&AuthPayload>,
    ) -> Result<Option<PresenceMember>, BrokerError> {
        let auth = auth.ok_or_else(|| BrokerError::AuthFailed(channel.to_string()))?;

        let channel_data = match kind {
            ChannelType::Presence => Some(
                auth.channel_data
                    .as_deref()
                    .ok_or_else(|| BrokerError::AuthFailed(channel.to_string()))?,
            ),
            _ => None,
        };

        if !AuthValidator::validate_token(
            &app.key,
            &app.secret,
            handle.id.as_str(),
            channel,
            &auth.auth,
            channel_data,
        ) {
            tracing::warn!(
                socket_id = %handle.id,
                channel = %channel,
                "Invalid subscription signature"
            );
            return Err(BrokerError::AuthFailed(channel.to_string()));
        }

        channel_data
            .map(PresenceMember::from_channel_data)
            .transpose()
    }

    /// Unsubscribe a connection from a channel. Returns false if it was not subscribed.
    pub async fn unsubscribe(&self, handle: &Arc<ConnectionHandle>, channel: &str) -> bool {
        let mut subscriptions = handle.subscriptions.write().await;
        if !subscriptions.remove(channel) {
            return false;
        }
        let announcement = self.detach(&handle.app_id, channel, &handle.id);
        drop(subscriptions);

        if let Some((recipients, message)) = announcement {
            Self::deliver(&recipients, &message);
        }

        tracing::debug!(socket_id = %handle.id, channel = %channel, "Unsubscribed from channel");
        true
    }

    /// Remove a connection from every channel it is subscribed to.
    /// Returns the number of channels left.
    pub async fn remove_connection(&self, handle: &Arc<ConnectionHandle>) -> usize {
        let mut subscriptions = handle.subscriptions.write().await;
        let channels: Vec<String> = subscriptions.drain().collect();
        let announcements: Vec<Announcement> = channels
            .iter()
            .filter_map(|channel| self.detach(&handle.app_id, channel, &handle.id))
            .collect();
        drop(subscriptions);

        for (recipients, message) in announcements {
            Self::deliver(&recipients, &message);
        }

        channels.len()
    }

    /// Drop one subscriber from a channel entry, deleting the entry when it
    /// becomes empty. Returns the `member_removed` announcement to make, if any.
    fn detach(&self, app_id: &str, channel: &str, socket_id: &SocketId) -> Option<Announcement> {
        let key = ChannelKey::new(app_id, channel);

        let (announcement, vacated) = match self.channels.get_mut(&key) {
            Some(mut entry) => {
                let state = entry.value_mut();
                state.subscribers.remove(socket_id);

                let announcement = state.remove_member(socket_id).map(|user_id| {
                    let recipients = state.subscribers.values().cloned().collect();
                    (recipients, ServerMessage::member_removed(channel, &user_id))
                });
                (announcement, state.subscribers.is_empty())
            }
            None => (None, false),
        };

        if vacated
            && self
                .channels
                .remove_if(&key, |_, state| state.subscribers.is_empty())
                .is_some()
        {
            tracing::debug!(app_id = %app_id, channel = %channel, "Channel vacated");
        }

        announcement
    }

    /// Deliver a message to every subscriber of a channel except `exclude`.
    ///
    /// Subscribers are snapshotted under the channel lock and served after it
    /// is released. Sends never wait: a subscriber with a full queue is
    /// disconnected and counted as failed.
    pub fn broadcast(
        &self,
        app_id: &str,
        channel: &str,
        message: &ServerMessage,
        exclude: Option<&SocketId>,
    ) -> DeliveryResult {
        let key = ChannelKey::new(app_id, channel);
        let recipients: Vec<Arc<ConnectionHandle>> = match self.channels.get(&key) {
            Some(entry) => entry
                .subscribers
                .iter()
                .filter(|(id, _)| Some(*id) != exclude)
                .map(|(_, handle)| handle.clone())
                .collect(),
            None => return DeliveryResult::default(),
        };

        Self::deliver(&recipients, message)
    }

    fn deliver(recipients: &[Arc<ConnectionHandle>], message: &ServerMessage) -> DeliveryResult {
        let mut result = DeliveryResult::default();
        if recipients.is_empty() {
            return result;
        }

        // For larger sends, pre-serialize once and share across all connections
        let outbound = if recipients.len() >= PRESERIALIZATION_THRESHOLD {
            match OutboundMessage::preserialized(message) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        "Failed to pre-serialize message, serializing per connection"
                    );
                    OutboundMessage::Raw(message.clone())
                }
            }
        } else {
            OutboundMessage::Raw(message.clone())
        };

        for handle in recipients {
            match handle.try_send(outbound.clone()) {
                Ok(()) => result.delivered += 1,
                Err(DeliveryError::Overflow) | Err(DeliveryError::Closed) => result.failed += 1,
            }
        }

        result
    }

    /// Connections subscribed to a channel, with presence payloads for presence channels
    pub fn members_of(&self, app_id: &str, channel: &str) -> Option<ChannelMembers> {
        self.channels
            .get(&ChannelKey::new(app_id, channel))
            .map(|entry| ChannelMembers {
                connections: entry.subscribers.keys().cloned().collect(),
                users: entry.members.clone(),
            })
    }

    /// Presence payload of one connection on a channel
    pub fn member(
        &self,
        app_id: &str,
        channel: &str,
        socket_id: &SocketId,
    ) -> Option<PresenceMember> {
        self.channels
            .get(&ChannelKey::new(app_id, channel))
            .and_then(|entry| entry.members.get(socket_id).cloned())
    }

    pub fn presence_roster(&self, app_id: &str, channel: &str) -> Option<PresenceRoster> {
        self.channels
            .get(&ChannelKey::new(app_id, channel))
            .filter(|entry| entry.kind == ChannelType::Presence)
            .map(|entry| entry.roster())
    }

    pub fn channel_info(&self, app_id: &str, channel: &str) -> Option<ChannelInfo> {
        self.channels
            .get(&ChannelKey::new(app_id, channel))
            .map(|entry| ChannelInfo {
                name: channel.to_string(),
                channel_type: entry.kind,
                subscriber_count: entry.subscribers.len(),
                user_count: entry.user_count(),
            })
    }

    /// All occupied channels of an app
    pub fn channels_for_app(&self, app_id: &str) -> Vec<ChannelInfo> {
        let mut channels: Vec<ChannelInfo> = self
            .channels
            .iter()
            .filter(|entry| entry.key().app_id == app_id)
            .map(|entry| ChannelInfo {
                name: entry.key().name.clone(),
                channel_type: entry.kind,
                subscriber_count: entry.subscribers.len(),
                user_count: entry.user_count(),
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        channels
    }

    pub fn subscriber_count(&self, app_id: &str, channel: &str) -> usize {
        self.channels
            .get(&ChannelKey::new(app_id, channel))
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_occupied(&self, app_id: &str, channel: &str) -> bool {
        self.channels.contains_key(&ChannelKey::new(app_id, channel))
    }

    /// Total number of occupied channels across all apps
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}
