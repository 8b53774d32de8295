//! Randomized subscription sequences
//!
//! Arbitrary subscribe, unsubscribe and disconnect interleavings must leave
//! the channel entries and each connection's own subscription set agreeing.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use tokio::sync::mpsc;

use realtime_broker::apps::App;
use realtime_broker::auth::AuthValidator;
use realtime_broker::channel::AuthPayload;
use realtime_broker::config::Settings;
use realtime_broker::connection_manager::ConnectionHandle;
use realtime_broker::server::AppState;
use realtime_broker::websocket::OutboundMessage;

const CONNECTIONS: usize = 3;
const CHANNELS: [&str; 3] = ["news", "sports", "presence-room"];

#[derive(Debug, Clone)]
enum Op {
    Subscribe(usize, usize),
    Unsubscribe(usize, usize),
    Disconnect(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..CONNECTIONS, 0..CHANNELS.len()).prop_map(|(c, ch)| Op::Subscribe(c, ch)),
        2 => (0..CONNECTIONS, 0..CHANNELS.len()).prop_map(|(c, ch)| Op::Unsubscribe(c, ch)),
        1 => (0..CONNECTIONS).prop_map(Op::Disconnect),
    ]
}

struct Client {
    handle: Arc<ConnectionHandle>,
    _rx: mpsc::Receiver<OutboundMessage>,
}

fn test_app() -> App {
    App {
        id: "app-1".into(),
        key: "key-1".into(),
        secret: "secret-1".into(),
        max_connections: 0,
        ..App::default()
    }
}

fn connect(state: &AppState, app: &App) -> Client {
    let (tx, rx) = mpsc::channel(64);
    let handle = state.registry.register(app, tx).unwrap();
    handle.mark_open();
    Client { handle, _rx: rx }
}

/// Two users shared between the connections, so one user can hold several sockets
fn user_of(slot: usize) -> String {
    format!("user-{}", slot % 2)
}

fn auth_for(
    app: &App,
    handle: &ConnectionHandle,
    channel: &str,
    slot: usize,
) -> Option<AuthPayload> {
    if !channel.starts_with("presence-") {
        return None;
    }
    let data = json!({ "user_id": user_of(slot), "user_info": { "slot": slot } }).to_string();
    Some(AuthPayload {
        auth: AuthValidator::auth_token(
            &app.key,
            &app.secret,
            handle.id.as_str(),
            channel,
            Some(&data),
        ),
        channel_data: Some(data),
    })
}

async fn run(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let app = test_app();
    let state = AppState::new(Settings {
        apps: vec![app.clone()],
        ..Settings::default()
    });
    let mut clients: Vec<Client> = (0..CONNECTIONS).map(|_| connect(&state, &app)).collect();
    let mut retired: Vec<Arc<ConnectionHandle>> = Vec::new();
    // Expected (slot, channel) subscriptions
    let mut model: HashSet<(usize, usize)> = HashSet::new();

    for op in ops {
        match op {
            Op::Subscribe(slot, ch) => {
                let handle = &clients[slot].handle;
                let auth = auth_for(&app, handle, CHANNELS[ch], slot);
                let result = state
                    .channels
                    .subscribe(&app, handle, CHANNELS[ch], auth.as_ref())
                    .await;
                prop_assert!(result.is_ok(), "subscribe failed: {:?}", result.err());
                model.insert((slot, ch));
            }
            Op::Unsubscribe(slot, ch) => {
                let handle = &clients[slot].handle;
                let removed = state.channels.unsubscribe(handle, CHANNELS[ch]).await;
                let expected = model.remove(&(slot, ch));
                prop_assert_eq!(removed, expected);
            }
            Op::Disconnect(slot) => {
                let fresh = connect(&state, &app);
                let old = std::mem::replace(&mut clients[slot], fresh);
                prop_assert!(state.registry.deregister(&old.handle.id).await);
                model.retain(|(s, _)| *s != slot);
                retired.push(old.handle);
            }
        }
    }

    let mut occupied = 0;
    for (ch, channel) in CHANNELS.iter().enumerate() {
        let members = state.channels.members_of("app-1", channel);
        if let Some(members) = &members {
            prop_assert!(!members.connections.is_empty(), "empty entry left for {}", channel);
            occupied += 1;
        }

        for (slot, client) in clients.iter().enumerate() {
            let listed = members
                .as_ref()
                .is_some_and(|m| m.connections.contains(&client.handle.id));
            prop_assert_eq!(listed, client.handle.is_subscribed(channel).await);
            prop_assert_eq!(listed, model.contains(&(slot, ch)));
        }

        for handle in &retired {
            let listed = members.as_ref().is_some_and(|m| m.connections.contains(&handle.id));
            prop_assert!(!listed, "disconnected {} still on {}", handle.id, channel);
        }

        if channel.starts_with("presence-") {
            let expected: BTreeSet<String> = model
                .iter()
                .filter(|(_, c)| *c == ch)
                .map(|(slot, _)| user_of(*slot))
                .collect();
            let ids: BTreeSet<String> = state
                .channels
                .presence_roster("app-1", channel)
                .map(|roster| roster.ids.into_iter().collect())
                .unwrap_or_default();
            prop_assert_eq!(ids, expected);
        }
    }
    prop_assert_eq!(state.channels.channel_count(), occupied);

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn subscription_views_always_agree(ops in proptest::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run(ops))?;
    }
}
