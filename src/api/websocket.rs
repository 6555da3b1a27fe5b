//! WebSocket stream of pipeline events and animation state

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use super::{ApiState, ControlCommand};
use crate::animation::AnimationState;

/// Incoming WebSocket message from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsIncoming {
    /// Cancel the current turn
    Stop,
    /// Ping to keep connection alive
    Ping,
}

/// Outgoing messages that are not pipeline events
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsOutgoing {
    /// Latest face pose
    Animation { state: AnimationState },
    /// This client fell behind and missed events
    Lagged { skipped: u64 },
    /// The client sent something unusable
    Error { message: String },
    /// Pong response
    Pong,
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/events", get(ws_upgrade))
        .with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json<T: Serialize>(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    value: &T,
) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize websocket message");
            true
        }
    }
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.events.subscribe());
    let mut animation = WatchStream::new(state.animation.clone());

    tracing::info!("event websocket connected");

    loop {
        let delivered = tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => send_json(&mut sender, &event).await,
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "event websocket lagging");
                    send_json(&mut sender, &WsOutgoing::Lagged { skipped }).await
                }
                None => false,
            },
            Some(pose) = animation.next() => {
                send_json(&mut sender, &WsOutgoing::Animation { state: pose }).await
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match handle_incoming(&state, &text).await {
                        Some(reply) => send_json(&mut sender, &reply).await,
                        None => true,
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => false,
                Some(Ok(_)) => true,
            },
        };

        if !delivered {
            break;
        }
    }

    tracing::info!("event websocket disconnected");
}

/// Apply a client message, returning any direct reply
async fn handle_incoming(state: &ApiState, text: &str) -> Option<WsOutgoing> {
    match serde_json::from_str::<WsIncoming>(text) {
        Ok(WsIncoming::Stop) => {
            if state.control.send(ControlCommand::Stop).await.is_err() {
                tracing::warn!("stop requested but pipeline is not running");
            }
            None
        }
        Ok(WsIncoming::Ping) => Some(WsOutgoing::Pong),
        Err(e) => Some(WsOutgoing::Error {
            message: format!("invalid message: {e}"),
        }),
    }
}
