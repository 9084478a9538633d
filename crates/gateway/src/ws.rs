//! `GET /v1/chat/ws` — WebSocket transport.
//!
//! Protocol:
//! - Client → Server: `{"action": "chat", "data": <chat completion request>}`
//!   or `{"action": "resume", "stream_id": "..."}`
//! - Server → Client: `stream_start`, `chunk`, `error`, `stream_end` frames
//!
//! One connection handles its requests one at a time. A socket that drops
//! mid-generation leaves the generation running and buffering.

use axum::{
    extract::State,
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use streamweave_agent::new_stream_id;
use streamweave_core::generation::GenerationRequest;
use tracing::{debug, info, warn};

use crate::relay::{self, FrameStream, RelayFrame};
use crate::{GatewayState, SharedState};

/// A message from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WsClientMessage {
    Chat { data: GenerationRequest },
    Resume { stream_id: String },
}

/// A frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    StreamStart {
        stream_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        resumed: bool,
    },
    Chunk {
        content: String,
    },
    StreamEnd,
    Error {
        message: String,
    },
}

/// The socket went away.
struct Disconnected;

pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(mut socket: WebSocket, state: SharedState) {
    info!("WebSocket connection established");

    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue, // ignore binary, ping, pong
            Err(_) => break,
        };

        let outcome = match serde_json::from_str::<WsClientMessage>(&text) {
            Ok(WsClientMessage::Chat { data }) => chat(&mut socket, &state, data).await,
            Ok(WsClientMessage::Resume { stream_id }) => resume(&mut socket, &state, &stream_id).await,
            Err(e) => {
                send(&mut socket, &WsServerMessage::Error { message: format!("Invalid message: {e}") }).await
            }
        };
        if outcome.is_err() {
            break;
        }
    }

    info!("WebSocket connection closed");
}

/// Start a generation under a fresh id and forward it.
async fn chat(socket: &mut WebSocket, state: &GatewayState, data: GenerationRequest) -> Result<(), Disconnected> {
    let stream_id = new_stream_id();

    let prepared = match data.validate() {
        Ok(()) => state.orchestrator.prepare(&data, stream_id.clone()).await,
        Err(e) => Err(e),
    };
    let prepared = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            send(socket, &WsServerMessage::Error { message: e.to_string() }).await?;
            return send(socket, &WsServerMessage::StreamEnd).await;
        }
    };

    let Some(claim) = state.generations.claim(&stream_id) else {
        send(socket, &WsServerMessage::Error { message: "Stream already in progress".into() }).await?;
        return send(socket, &WsServerMessage::StreamEnd).await;
    };

    send(socket, &WsServerMessage::StreamStart { stream_id: stream_id.clone(), resumed: false }).await?;
    let frames = relay::spawn(state, prepared, claim);
    forward(socket, &stream_id, frames).await
}

/// Replay a generation's buffered chunks, then follow it live if unfinished.
async fn resume(socket: &mut WebSocket, state: &GatewayState, stream_id: &str) -> Result<(), Disconnected> {
    let Some(frames) = relay::resume(state, stream_id, 0).await else {
        return send(socket, &WsServerMessage::Error { message: "Stream not found or expired".into() }).await;
    };

    send(socket, &WsServerMessage::StreamStart { stream_id: stream_id.to_string(), resumed: true }).await?;
    forward(socket, stream_id, frames).await
}

async fn forward(socket: &mut WebSocket, stream_id: &str, mut frames: FrameStream) -> Result<(), Disconnected> {
    while let Some(frame) = frames.next().await {
        let message = match frame {
            RelayFrame::Chunk(content) => WsServerMessage::Chunk { content },
            RelayFrame::Error { message, .. } => WsServerMessage::Error { message },
            RelayFrame::End { .. } => WsServerMessage::StreamEnd,
        };
        if send(socket, &message).await.is_err() {
            debug!(stream_id, "Client disconnected mid-stream; generation continues");
            return Err(Disconnected);
        }
    }
    Ok(())
}

async fn send(socket: &mut WebSocket, message: &WsServerMessage) -> Result<(), Disconnected> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to encode WebSocket frame");
            return Ok(());
        }
    };
    socket.send(WsMessage::Text(json.into())).await.map_err(|_| Disconnected)
}
