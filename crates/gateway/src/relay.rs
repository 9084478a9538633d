//! Bridges an orchestrator generation to a transport.
//!
//! The relay task owns the generation's claim, mirrors every delta into the
//! stream buffer, and forwards it to whichever transport started it. The
//! transport may go away at any time; the relay keeps draining the
//! orchestrator and buffering so a later reader can resume.

use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use streamweave_agent::{ErrorKind, GenerationEvent, PreparedGeneration};
use streamweave_core::error::Result;
use streamweave_core::event::DomainEvent;
use streamweave_core::generation::ChatCompletion;
use streamweave_stream::{GenerationClaim, StreamBuffer};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::GatewayState;

/// What a transport renders, in order: chunks, at most one error, one end.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Chunk(String),
    Error { kind: ErrorKind, message: String },
    End { completed: bool },
}

pub type FrameStream = BoxStream<'static, RelayFrame>;

/// Start relaying a prepared generation. `claim` must hold its stream id.
pub fn spawn(state: &GatewayState, prepared: PreparedGeneration, claim: GenerationClaim) -> FrameStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let events = state.orchestrator.stream(prepared);
    tokio::spawn(relay(state.buffer.clone(), events, claim, tx));
    UnboundedReceiverStream::new(rx).boxed()
}

async fn relay(
    buffer: StreamBuffer,
    mut events: mpsc::Receiver<GenerationEvent>,
    claim: GenerationClaim,
    tx: mpsc::UnboundedSender<RelayFrame>,
) {
    let id = claim.id().to_string();
    let mut completed = false;

    while let Some(event) = events.recv().await {
        let frame = match event {
            GenerationEvent::Started { .. } => continue,
            GenerationEvent::Delta { content } => {
                buffer.append(&id, &content).await.log_degraded(&id, "append");
                RelayFrame::Chunk(content)
            }
            GenerationEvent::Error { kind, message, .. } => RelayFrame::Error { kind, message },
            GenerationEvent::Done { .. } => {
                completed = true;
                continue;
            }
        };
        if tx.send(frame).is_err() {
            debug!(stream_id = %id, "Transport gone, still buffering");
        }
    }

    buffer.mark_done(&id).await.log_degraded(&id, "mark_done");
    let _ = tx.send(RelayFrame::End { completed });
    debug!(stream_id = %id, completed, "Relay finished");
    drop(claim);
}

/// Run a prepared generation to completion while holding its claim.
///
/// The final content is buffered as a single chunk, so readers that attached
/// while it ran, and later pollers, see the same result.
pub async fn complete(
    state: &GatewayState,
    prepared: PreparedGeneration,
    claim: GenerationClaim,
) -> Result<ChatCompletion> {
    let id = claim.id().to_string();
    let result = state.orchestrator.complete_prepared(prepared).await;

    if let Ok(completion) = &result {
        if !completion.content().is_empty() {
            state.buffer.append(&id, completion.content()).await.log_degraded(&id, "append");
        }
    }
    state.buffer.mark_done(&id).await.log_degraded(&id, "mark_done");
    drop(claim);
    result
}

/// Follow an existing generation from `offset`: buffered chunks first, then
/// live ones. Returns `None` when the id is unknown or expired.
pub async fn resume(state: &GatewayState, id: &str, offset: usize) -> Option<FrameStream> {
    let buffered = match state.buffer.get_chunks(id, 0).await {
        Ok(snapshot) => snapshot.exists,
        Err(e) => {
            debug!(stream_id = id, error = %e, "Buffer read failed while resuming");
            false
        }
    };
    if !buffered && !state.generations.is_active(id) {
        return None;
    }

    info!(stream_id = id, offset, "Resuming stream");
    state.orchestrator.events().publish(DomainEvent::StreamResumed {
        stream_id: id.to_string(),
        offset,
        timestamp: Utc::now(),
    });

    let chunks = state.buffer.subscribe_from(id, offset).map(RelayFrame::Chunk);
    let end = futures::stream::once(async { RelayFrame::End { completed: true } });
    Some(chunks.chain(end).boxed())
}

/// Whether `id` names a generation a new request should attach to rather
/// than start.
pub async fn is_known(state: &GatewayState, id: &str) -> bool {
    if state.generations.is_active(id) {
        return true;
    }
    matches!(state.buffer.get_chunks(id, 0).await, Ok(snapshot) if snapshot.exists)
}
