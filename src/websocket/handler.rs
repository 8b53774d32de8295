use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::apps::App;
use crate::channel::AuthPayload;
use crate::connection_manager::{CloseReason, ConnectionHandle};
use crate::error::BrokerError;
use crate::server::AppState;

use super::message::{ClientMessage, OutboundMessage, ServerMessage, SubscribeData};

/// Upper bound on the error frame plus close frame for a closing connection
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound on the close frame for a connection dropped for backpressure
const STALLED_CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Handshake query parameters sent by Pusher client libraries
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub protocol: Option<u8>,
    pub client: Option<String>,
    pub version: Option<String>,
}

/// WebSocket upgrade handler for `/app/{key}`
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query),
    fields(client = ?query.client, protocol = ?query.protocol)
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(app_key): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let ws = ws.max_message_size(state.settings.websocket.max_message_size);

    let Some(app) = state.apps.find_by_key(&app_key) else {
        tracing::warn!(app_key = %app_key, "WebSocket upgrade for unknown app key");
        let err = BrokerError::AppNotFound(app_key);
        return ws.on_upgrade(move |socket| reject_socket(socket, err));
    };

    tracing::debug!(app_id = %app.id, version = ?query.version, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, state, app))
}

/// Send a `pusher:error` and close the socket with the same code
async fn reject_socket(socket: WebSocket, err: BrokerError) {
    let (mut ws_sender, _) = socket.split();
    let error_msg = ServerMessage::from_error(&err);
    if let Ok(json) = serde_json::to_string(&error_msg) {
        let _ = ws_sender.send(Message::Text(json.into())).await;
    }
    close_with(&mut ws_sender, err.code(), &err.to_string()).await;
}

async fn close_with(ws_sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = ws_sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
    let _ = ws_sender.close().await;
}

/// Handle an established WebSocket connection
#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state, app),
    fields(app_id = %app.id)
)]
async fn handle_socket(socket: WebSocket, state: AppState, app: Arc<App>) {
    let connection_start = std::time::Instant::now();
    let ws_config = &state.settings.websocket;

    // Create channel for sending messages to this connection
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(ws_config.outbound_buffer);

    // Register connection with limit checking
    let handle = match state.registry.register(&app, tx) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(error = %e, "Connection rejected");
            reject_socket(socket, e).await;
            return;
        }
    };
    let socket_id = handle.id.clone();

    let established =
        ServerMessage::connection_established(socket_id.as_str(), ws_config.activity_timeout);
    if handle.send(established).is_err() {
        state.registry.deregister(&socket_id).await;
        return;
    }
    handle.mark_open();

    tracing::info!(socket_id = %socket_id, "WebSocket connection established");

    // Split socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task for sending messages from channel to WebSocket. Every write is
    // raced against the close signal so a peer that stopped reading cannot
    // hold the task inside a pending send.
    let send_handle = handle.clone();
    let mut send_task = tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                biased;
                reason = send_handle.closed() => break reason,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break None };
                    // Pre-serialized messages avoid the serialization cost here
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize message");
                            continue;
                        }
                    };

                    tokio::select! {
                        res = ws_sender.send(Message::Text(text.into())) => {
                            if res.is_err() {
                                break None;
                            }
                        }
                        reason = send_handle.closed() => break reason,
                    }
                }
            }
        };

        let Some(reason) = reason else { return };
        // A peer that is not draining its socket only gets a bounded attempt at
        // the close frame before the sink is dropped
        let (bound, goodbye) = match reason {
            CloseReason::Backpressure => (STALLED_CLOSE_TIMEOUT, None),
            _ => (
                CLOSE_HANDSHAKE_TIMEOUT,
                serde_json::to_string(&ServerMessage::error(reason.code(), reason.message())).ok(),
            ),
        };
        let close = async {
            if let Some(json) = goodbye {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            close_with(&mut ws_sender, reason.code(), reason.message()).await;
        };
        if tokio::time::timeout(bound, close).await.is_err() {
            tracing::debug!(code = reason.code(), "Close frame not delivered, dropping socket");
        }
    });

    // Task for receiving messages from WebSocket
    let state_clone = state.clone();
    let handle_clone = handle.clone();
    let app_clone = app.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &state_clone, &app_clone, &handle_clone).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(socket_id = %socket_id, "Send task completed");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            tracing::debug!(socket_id = %socket_id, "Receive task completed");
            send_task.abort();
        }
    }

    state.registry.deregister(&socket_id).await;

    tracing::info!(
        socket_id = %socket_id,
        close_reason = ?handle.close_reason(),
        duration_secs = connection_start.elapsed().as_secs_f64(),
        "WebSocket connection closed"
    );
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_message(
    msg: Message,
    state: &AppState,
    app: &App,
    handle: &Arc<ConnectionHandle>,
) -> bool {
    match msg {
        Message::Text(text) => {
            handle.update_activity();

            match ClientMessage::parse(text.as_str()) {
                Ok(client_msg) => handle_client_message(client_msg, state, app, handle).await,
                Err(e) => {
                    tracing::warn!(socket_id = %handle.id, error = %e, "Dropping malformed frame");
                    let _ = handle.send(ServerMessage::from_error(&e));
                }
            }
            true
        }
        Message::Binary(_) => {
            let err = BrokerError::InvalidMessage("Binary messages are not supported".into());
            let _ = handle.send(ServerMessage::from_error(&err));
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            // Axum answers transport pings itself
            handle.update_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(socket_id = %handle.id, "Received close frame");
            false
        }
    }
}

/// Handle a parsed client message
async fn handle_client_message(
    msg: ClientMessage,
    state: &AppState,
    app: &App,
    handle: &Arc<ConnectionHandle>,
) {
    match msg {
        ClientMessage::Subscribe(data) => handle_subscribe(data, state, app, handle).await,
        ClientMessage::Unsubscribe { channel } => {
            state.channels.unsubscribe(handle, &channel).await;
        }
        ClientMessage::Ping => {
            let _ = handle.send(ServerMessage::pong());
        }
        ClientMessage::Pong => {}
        ClientMessage::ClientEvent {
            channel,
            event,
            data,
        } => {
            if let Err(e) = state
                .router
                .route_client_event(&handle.id, &channel, &event, data)
                .await
            {
                tracing::debug!(
                    socket_id = %handle.id,
                    channel = %channel,
                    error = %e,
                    "Client event refused"
                );
                let _ = handle.send(ServerMessage::from_error(&e));
            }
        }
    }
}

/// Handle channel subscription
#[tracing::instrument(
    name = "ws.subscribe",
    skip(data, state, app, handle),
    fields(socket_id = %handle.id, channel = %data.channel)
)]
async fn handle_subscribe(
    data: SubscribeData,
    state: &AppState,
    app: &App,
    handle: &Arc<ConnectionHandle>,
) {
    let SubscribeData {
        channel,
        auth,
        channel_data,
    } = data;
    let auth = auth.map(|auth| AuthPayload { auth, channel_data });

    match state
        .channels
        .subscribe(app, handle, &channel, auth.as_ref())
        .await
    {
        Ok(result) => {
            let _ = handle.send(ServerMessage::subscription_succeeded(
                &channel,
                result.roster.as_ref(),
            ));
        }
        Err(e) => {
            tracing::warn!(error = %e, "Subscription refused");
            let _ = handle.send(ServerMessage::subscription_error(&channel, &e));
        }
    }
}
