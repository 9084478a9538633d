//! Domain event system — decoupled observation of generations.
//!
//! Events are published when something interesting happens in the system.
//! The gateway exposes them as an SSE log; tests subscribe to assert on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A generation passed preparation and is calling the model
    GenerationStarted {
        stream_id: String,
        model: String,
        session_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        stream_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A generation produced its final content
    GenerationCompleted {
        stream_id: String,
        model: String,
        tokens_used: u32,
        tool_calls: usize,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A generation ended with an error
    GenerationFailed {
        stream_id: String,
        stage: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// A reader attached to an existing generation
    StreamResumed {
        stream_id: String,
        offset: usize,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GenerationStarted { .. } => "generation_started",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::GenerationCompleted { .. } => "generation_completed",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::StreamResumed { .. } => "stream_resumed",
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
