//! Generation-level streaming events.
//!
//! `GenerationEvent` is what the orchestrator's producer task sends to a
//! transport. Tool-call fragments never appear here; they are consumed inside
//! the orchestrator.

use serde::{Deserialize, Serialize};
use streamweave_core::error::{Error, ProviderError};
use streamweave_core::provider::Usage;

/// Where in the pipeline a generation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStage {
    Prepare,
    FirstCall,
    ToolFollowUp,
}

impl GenerationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::FirstCall => "first_call",
            Self::ToolFollowUp => "tool_follow_up",
        }
    }
}

/// Coarse classification of an error, enough for a transport to render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    RateLimited,
    Timeout,
    Provider,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn of(error: &Error) -> Self {
        match error {
            Error::NotFound { .. } => Self::NotFound,
            Error::Validation(_) => Self::Validation,
            Error::Provider(e) => Self::of_provider(e),
            Error::Buffer(_) => Self::Unavailable,
            _ => Self::Internal,
        }
    }

    pub fn of_provider(error: &ProviderError) -> Self {
        match error {
            ProviderError::RateLimited { .. } => Self::RateLimited,
            ProviderError::Timeout(_) => Self::Timeout,
            _ => Self::Provider,
        }
    }
}

/// Events emitted by a streaming generation, in order:
/// `started`, any number of `delta`, then exactly one of `done` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// Preparation succeeded and the first model call is about to start.
    Started { stream_id: String, model: String },

    /// Visible content, forwarded as soon as the model produced it.
    Delta { content: String },

    /// The generation failed; nothing follows.
    Error {
        stage: GenerationStage,
        kind: ErrorKind,
        message: String,
    },

    /// The generation finished.
    Done {
        model: String,
        usage: Option<Usage>,
        latency_ms: u64,
        tool_calls_made: usize,
    },
}

impl GenerationEvent {
    pub fn error(stage: GenerationStage, error: &Error) -> Self {
        Self::Error {
            stage,
            kind: ErrorKind::of(error),
            message: error.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
