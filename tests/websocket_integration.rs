//! End-to-end WebSocket tests
//!
//! A real server is bound on an ephemeral port and driven with a
//! tungstenite client speaking the Pusher protocol.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use realtime_broker::apps::App;
use realtime_broker::auth::AuthValidator;
use realtime_broker::config::Settings;
use realtime_broker::server::{create_app, AppState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

fn test_app(max_connections: usize) -> App {
    App {
        id: "app-1".into(),
        key: "key-1".into(),
        secret: "secret-1".into(),
        max_connections,
        ..App::default()
    }
}

async fn start_server(apps: Vec<App>) -> (SocketAddr, AppState) {
    start_server_with(Settings {
        apps,
        ..Settings::default()
    })
    .await
}

async fn start_server_with(settings: Settings) -> (SocketAddr, AppState) {
    let state = AppState::new(settings);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn open(addr: SocketAddr, key: &str) -> Socket {
    let url = format!("ws://{}/app/{}?protocol=7&client=js&version=8.0.0", addr, key);
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

/// Next text frame as JSON; panics on close or timeout
async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(READ_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket.send(Message::text(value.to_string())).await.unwrap();
}

/// Open a connection and return it with its socket id
async fn connect(addr: SocketAddr, key: &str) -> (Socket, String) {
    let mut socket = open(addr, key).await;
    let established = next_json(&mut socket).await;
    assert_eq!(established["event"], "pusher:connection_established");
    let data: Value = serde_json::from_str(established["data"].as_str().unwrap()).unwrap();
    let socket_id = data["socket_id"].as_str().unwrap().to_string();
    (socket, socket_id)
}

async fn subscribe(socket: &mut Socket, channel: &str, auth: Option<String>) -> Value {
    let mut data = json!({ "channel": channel });
    if let Some(auth) = auth {
        data["auth"] = Value::String(auth);
    }
    send_json(socket, json!({ "event": "pusher:subscribe", "data": data })).await;
    next_json(socket).await
}

/// Wait for a close frame and return its code
async fn expect_close(socket: &mut Socket) -> u16 {
    loop {
        let msg = tokio::time::timeout(READ_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("read error");
        if let Message::Close(frame) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or_default();
        }
    }
}

#[tokio::test]
async fn test_handshake_subscribe_and_publish() {
    let (addr, state) = start_server(vec![test_app(10)]).await;
    let (mut socket, socket_id) = connect(addr, "key-1").await;
    assert!(!socket_id.is_empty());

    let reply = subscribe(&mut socket, "news", None).await;
    assert_eq!(reply["event"], "pusher_internal:subscription_succeeded");
    assert_eq!(reply["channel"], "news");

    let result = state
        .publisher
        .publish("app-1", "news", "headline", json!({ "title": "hello" }))
        .await
        .unwrap();
    assert_eq!(result.delivered, 1);

    let event = next_json(&mut socket).await;
    assert_eq!(event["event"], "headline");
    assert_eq!(event["channel"], "news");
    let data: Value = serde_json::from_str(event["data"].as_str().unwrap()).unwrap();
    assert_eq!(data["title"], "hello");
}

#[tokio::test]
async fn test_private_channel_client_events() {
    let app = test_app(10);
    let (addr, _state) = start_server(vec![app.clone()]).await;
    let channel = "private-chat";

    let (mut alice, alice_id) = connect(addr, "key-1").await;
    let (mut bob, bob_id) = connect(addr, "key-1").await;

    let token = AuthValidator::auth_token(&app.key, &app.secret, &alice_id, channel, None);
    let reply = subscribe(&mut alice, channel, Some(token)).await;
    assert_eq!(reply["event"], "pusher_internal:subscription_succeeded");

    let token = AuthValidator::auth_token(&app.key, &app.secret, &bob_id, channel, None);
    let reply = subscribe(&mut bob, channel, Some(token)).await;
    assert_eq!(reply["event"], "pusher_internal:subscription_succeeded");

    send_json(
        &mut alice,
        json!({ "event": "client-typing", "channel": channel, "data": { "typing": true } }),
    )
    .await;

    let event = next_json(&mut bob).await;
    assert_eq!(event["event"], "client-typing");
    assert_eq!(event["channel"], channel);

    // The sender gets nothing back; its next frame is the pong
    send_json(&mut alice, json!({ "event": "pusher:ping", "data": {} })).await;
    assert_eq!(next_json(&mut alice).await["event"], "pusher:pong");
}

#[tokio::test]
async fn test_private_channel_with_bad_signature() {
    let (addr, _state) = start_server(vec![test_app(10)]).await;
    let (mut socket, socket_id) = connect(addr, "key-1").await;

    let forged =
        AuthValidator::auth_token("key-1", "not-the-secret", &socket_id, "private-x", None);
    let reply = subscribe(&mut socket, "private-x", Some(forged)).await;
    assert_eq!(reply["event"], "pusher:subscription_error");
    assert_eq!(reply["channel"], "private-x");
    assert_eq!(reply["data"]["status"], 401);
}

#[tokio::test]
async fn test_unknown_app_key_is_closed() {
    let (addr, _state) = start_server(vec![test_app(10)]).await;
    let mut socket = open(addr, "no-such-key").await;

    let error = next_json(&mut socket).await;
    assert_eq!(error["event"], "pusher:error");
    assert_eq!(error["data"]["code"], 4001);
    assert_eq!(expect_close(&mut socket).await, 4001);
}

#[tokio::test]
async fn test_connection_over_quota_is_closed() {
    let (addr, state) = start_server(vec![test_app(1)]).await;
    let (_first, _) = connect(addr, "key-1").await;

    let mut second = open(addr, "key-1").await;
    let error = next_json(&mut second).await;
    assert_eq!(error["event"], "pusher:error");
    assert_eq!(error["data"]["code"], 4100);
    assert_eq!(expect_close(&mut second).await, 4100);
    assert_eq!(state.registry.app_connection_count("app-1"), 1);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let (addr, _state) = start_server(vec![test_app(10)]).await;
    let (mut socket, _) = connect(addr, "key-1").await;

    socket.send(Message::text("{not json")).await.unwrap();
    let error = next_json(&mut socket).await;
    assert_eq!(error["event"], "pusher:error");
    assert_eq!(error["data"]["code"], 4300);

    send_json(&mut socket, json!({ "event": "pusher:ping", "data": {} })).await;
    assert_eq!(next_json(&mut socket).await["event"], "pusher:pong");
}

#[tokio::test]
async fn test_disconnect_removes_subscriptions() {
    let (addr, state) = start_server(vec![test_app(10)]).await;
    let (mut socket, _) = connect(addr, "key-1").await;
    subscribe(&mut socket, "news", None).await;
    assert!(state.channels.is_occupied("app-1", "news"));

    socket.close(None).await.unwrap();

    let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
    while state.registry.count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.registry.count(), 0);
    assert!(!state.channels.is_occupied("app-1", "news"));
}

#[tokio::test]
async fn test_stalled_reader_is_dropped_and_frees_its_slot() {
    let mut settings = Settings {
        apps: vec![test_app(1)],
        ..Settings::default()
    };
    settings.websocket.outbound_buffer = 4;
    let (addr, state) = start_server_with(settings).await;

    // Subscribes, then never reads again
    let (mut stalled, _) = connect(addr, "key-1").await;
    subscribe(&mut stalled, "news", None).await;

    let payload = json!({ "blob": "x".repeat(256 * 1024) });
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while state.registry.count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "stalled reader was never disconnected"
        );
        state
            .publisher
            .publish("app-1", "news", "bulk", payload.clone())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(!state.channels.is_occupied("app-1", "news"));
    assert_eq!(state.registry.app_connection_count("app-1"), 0);

    // The quota of one is available again while the stalled socket is still held
    let (_next, socket_id) = connect(addr, "key-1").await;
    assert!(!socket_id.is_empty());
    drop(stalled);
}
