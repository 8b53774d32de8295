//! Connection handle and related types

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::websocket::{OutboundMessage, ServerMessage};

/// Socket identifier issued at handshake, of the form `<digits>.<digits>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SocketId(String);

impl SocketId {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let major: u32 = rng.random_range(0..1_000_000_000);
        let minor: u32 = rng.random_range(0..1_000_000_000);
        Self(format!("{}.{}", major, minor))
    }

    /// Parse a socket id presented by a client
    pub fn parse(value: &str) -> Option<Self> {
        Self::is_valid(value).then(|| Self(value.to_string()))
    }

    pub fn is_valid(value: &str) -> bool {
        match value.split_once('.') {
            Some((a, b)) => {
                !a.is_empty()
                    && !b.is_empty()
                    && a.bytes().all(|c| c.is_ascii_digit())
                    && b.bytes().all(|c| c.is_ascii_digit())
            }
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liveness of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why the server decided to close a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Outbound queue overflowed
    Backpressure,
    /// No activity within the connection timeout
    ActivityTimeout,
    ServerShutdown,
}

impl CloseReason {
    /// Pusher close code sent in the close frame
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Backpressure => 4100,
            CloseReason::ActivityTimeout => 4201,
            CloseReason::ServerShutdown => 4200,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CloseReason::Backpressure => "Outbound buffer full, connection too slow",
            CloseReason::ActivityTimeout => "Pong reply not received",
            CloseReason::ServerShutdown => "Server shutting down",
        }
    }
}

/// Failure to enqueue an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Queue full; the connection has been scheduled for disconnect
    Overflow,
    /// Connection is gone
    Closed,
}

/// Handle for a single WebSocket connection
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: SocketId,
    pub app_id: String,
    sender: mpsc::Sender<OutboundMessage>,
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp (Unix millis) - using AtomicI64 for lock-free updates
    last_activity: AtomicI64,
    state: AtomicU8,
    /// Channel names this connection is subscribed to.
    /// Held while the channel index is updated so both sides change together.
    pub subscriptions: RwLock<HashSet<String>>,
    close_reason: OnceLock<CloseReason>,
    close_notify: Notify,
}

impl ConnectionHandle {
    pub fn new(app_id: String, sender: mpsc::Sender<OutboundMessage>) -> Self {
        let now = Utc::now();
        Self {
            id: SocketId::generate(),
            app_id,
            sender,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            subscriptions: RwLock::new(HashSet::new()),
            close_reason: OnceLock::new(),
            close_notify: Notify::new(),
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    /// Milliseconds since the last inbound activity
    pub fn idle_millis(&self, now: DateTime<Utc>) -> i64 {
        (now.timestamp_millis() - self.last_activity.load(Ordering::Relaxed)).max(0)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state(), ConnectionState::Connecting | ConnectionState::Open)
    }

    /// Connecting -> Open, once the handshake reply is queued
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to Closing. Returns false if already closing or closed.
    pub(crate) fn begin_close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.close_notify.notify_one();
    }

    /// Ask the gateway serving this connection to close it.
    /// Only the first reason is kept.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.begin_close();
        self.close_notify.notify_one();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Resolve once the server has decided to close this connection
    pub async fn closed(&self) -> Option<CloseReason> {
        loop {
            if let Some(reason) = self.close_reason() {
                return Some(reason);
            }
            if self.state() == ConnectionState::Closed {
                return None;
            }
            self.close_notify.notified().await;
        }
    }

    /// Queue a message without waiting.
    ///
    /// A full queue means the client is not keeping up: the connection is
    /// closed rather than letting the sender wait.
    pub fn try_send(&self, message: OutboundMessage) -> Result<(), DeliveryError> {
        if !self.is_live() {
            return Err(DeliveryError::Closed);
        }
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    socket_id = %self.id,
                    app_id = %self.app_id,
                    "Outbound queue full, disconnecting"
                );
                self.close(CloseReason::Backpressure);
                Err(DeliveryError::Overflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Send a ServerMessage (will be serialized when written to the socket)
    pub fn send(&self, message: ServerMessage) -> Result<(), DeliveryError> {
        self.try_send(OutboundMessage::Raw(message))
    }

    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.read().await.contains(channel)
    }

    /// Get current subscription count
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}
