//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST /v1/chat/completions`    — Chat completion, JSON or SSE (`stream: true`)
//! - `GET  /v1/chat/stream/{id}`    — Poll a generation's buffered chunks from an offset
//! - `GET  /v1/chat/ws`             — WebSocket: start or resume generations
//! - `GET  /v1/tools`               — List public tools
//! - `POST /v1/sessions`            — Create a session
//! - `GET  /v1/events`              — SSE stream of domain events

use axum::{
    Router,
    body::Bytes,
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use streamweave_agent::new_stream_id;
use streamweave_core::error::Error;
use streamweave_core::generation::{ChatCompletion, ChatCompletionChunk, GenerationRequest};
use streamweave_core::provider::ToolDefinition;
use tracing::info;

use crate::error::{ApiError, ErrorBody, ErrorEnvelope};
use crate::relay::{self, FrameStream, RelayFrame};
use crate::{SharedState, ws};

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat/completions", post(chat_completions_handler))
        .route("/chat/stream/{id}", get(poll_stream_handler))
        .route("/chat/ws", get(ws::ws_handler))
        .route("/tools", get(list_tools_handler))
        .route("/sessions", post(create_session_handler))
        .route("/events", get(event_stream_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(default)]
    offset: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub stream_id: String,
    pub chunks: Vec<String>,
    pub offset: usize,
    pub total: usize,
    pub done: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolDefinition>,
    pub count: usize,
}

#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    channel_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

// ── Chat completions ──────────────────────────────────────────────────────

/// `POST /v1/chat/completions`
///
/// A `stream_id` naming a generation that is running or still buffered
/// attaches to it instead of generating again.
async fn chat_completions_handler(
    State(state): State<SharedState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    req.validate()?;
    info!(stream = req.stream, model = %req.model, session = ?req.session_id, "v1/chat/completions request");

    if let Some(id) = req.stream_id.as_deref() {
        if relay::is_known(&state, id).await {
            return attach(&state, &req, id).await;
        }
    }

    let stream_id = req.stream_id.clone().unwrap_or_else(new_stream_id);
    let Some(claim) = state.generations.claim(&stream_id) else {
        // Lost a race with another request for the same id
        return attach(&state, &req, &stream_id).await;
    };
    let prepared = state.orchestrator.prepare(&req, stream_id.clone()).await?;

    if !req.stream {
        let completion = relay::complete(&state, prepared, claim).await?;
        return Ok(Json(completion).into_response());
    }

    let model = prepared.model.clone();
    let frames = relay::spawn(&state, prepared, claim);

    Ok(sse_response(stream_id, model, frames).into_response())
}

/// Serve an existing generation: replay then live for SSE, or the collected
/// content for JSON.
async fn attach(state: &SharedState, req: &GenerationRequest, id: &str) -> Result<Response, ApiError> {
    let frames = relay::resume(state, id, 0).await.ok_or_else(ApiError::stream_not_found)?;

    if req.stream {
        return Ok(sse_response(id.to_string(), req.model.clone(), frames).into_response());
    }

    let content: String = frames
        .filter_map(|frame| async move {
            match frame {
                RelayFrame::Chunk(text) => Some(text),
                _ => None,
            }
        })
        .collect()
        .await;
    Ok(Json(ChatCompletion::new(id, req.model.clone(), content, None)).into_response())
}

/// SSE body: the generation id first, then OpenAI-style deltas, then `[DONE]`.
fn sse_response(
    stream_id: String,
    model: String,
    frames: FrameStream,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let head = json_event(&serde_json::json!({ "stream_id": stream_id }));
    let body = frames.flat_map(move |frame| stream::iter(render_frame(&stream_id, &model, frame)));

    Sse::new(stream::once(async { head }).chain(body).map(Ok)).keep_alive(KeepAlive::default())
}

fn render_frame(stream_id: &str, model: &str, frame: RelayFrame) -> Vec<SseEvent> {
    match frame {
        RelayFrame::Chunk(content) => vec![json_event(&ChatCompletionChunk::delta(stream_id, model, content))],
        RelayFrame::Error { kind, message } => vec![json_event(&ErrorEnvelope {
            error: ErrorBody::of(kind, message),
        })],
        RelayFrame::End { completed } => {
            let mut events = Vec::with_capacity(2);
            if completed {
                events.push(json_event(&ChatCompletionChunk::finish(stream_id, model)));
            }
            events.push(SseEvent::default().data("[DONE]"));
            events
        }
    }
}

fn json_event<T: Serialize>(value: &T) -> SseEvent {
    SseEvent::default().data(serde_json::to_string(value).unwrap_or_default())
}

// ── Poll ──────────────────────────────────────────────────────────────────

/// `GET /v1/chat/stream/{id}?offset=N` — Resume by re-fetching.
async fn poll_stream_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    query: Result<Query<PollQuery>, QueryRejection>,
) -> Result<Json<PollResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::from(e).with_param("offset"))?;
    let snapshot = state.buffer.get_chunks(&id, query.offset).await?;

    // A running generation that has not produced a chunk yet has no record
    if !snapshot.exists && !state.generations.is_active(&id) {
        return Err(ApiError::stream_not_found());
    }

    Ok(Json(PollResponse {
        stream_id: id,
        chunks: snapshot.chunks,
        offset: query.offset,
        total: snapshot.total,
        done: snapshot.done,
    }))
}

// ── Tools ─────────────────────────────────────────────────────────────────

async fn list_tools_handler(State(state): State<SharedState>) -> Json<ToolListResponse> {
    let tools = state.orchestrator.tools().public_definitions();
    let count = tools.len();
    Json(ToolListResponse { tools, count })
}

// ── Sessions ──────────────────────────────────────────────────────────────

/// `POST /v1/sessions` — body optional: `{"channel_id": "..."}`.
async fn create_session_handler(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let req: CreateSessionRequest = if body.is_empty() {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::validation(format!("Invalid body: {e}")))?
    };

    let persistence = state.orchestrator.persistence();
    if let Some(channel_id) = req.channel_id.as_deref() {
        let channel = persistence.load_channel(channel_id).await.map_err(Error::from)?;
        if channel.is_none() {
            return Err(Error::not_found("channel", channel_id).into());
        }
    }

    let session_id = persistence
        .create_session(req.channel_id.as_deref())
        .await
        .map_err(Error::from)?;
    info!(session_id = %session_id, channel = ?req.channel_id, "Session created");

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id,
            channel_id: req.channel_id,
        }),
    ))
}

// ── Domain event stream ───────────────────────────────────────────────────

/// `GET /v1/events` — SSE stream of domain events.
async fn event_stream_handler(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.orchestrator.events().subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(|result| async move { result.ok() })
        .map(|event| {
            let data = serde_json::to_string(event.as_ref()).unwrap_or_default();
            Ok(SseEvent::default().event(event.kind()).data(data))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
