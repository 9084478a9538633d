//! The shared store seam behind the stream buffer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use streamweave_core::error::BufferError;
use tokio::sync::broadcast;

/// A point-in-time read of one stream record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Chunks from the requested offset onward, in append order
    pub chunks: Vec<String>,

    /// Total number of chunks in the record
    pub total: usize,

    /// Terminal flag; never reverts once set
    pub done: bool,

    /// Whether the record exists at all. A record created by `set_done`
    /// alone exists with zero chunks.
    pub exists: bool,
}

/// Live notification for subscribers of one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    /// The chunk stored at `index`
    Chunk { index: usize, content: String },

    /// The generation finished
    Done,
}

/// Storage primitives for stream records.
///
/// Every operation is atomic per call. Writes refresh the record's TTL.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// The backend name (e.g., "memory").
    fn name(&self) -> &str;

    /// Append a chunk, creating the record if needed. Returns the new length.
    async fn push(&self, id: &str, chunk: String, ttl: Duration) -> Result<usize, BufferError>;

    /// Read chunks from `offset` onward plus the record's flags.
    async fn read(&self, id: &str, offset: usize) -> Result<Snapshot, BufferError>;

    /// Set the terminal flag, creating the record if needed. Returns `true`
    /// if this call flipped it.
    async fn set_done(&self, id: &str, ttl: Duration) -> Result<bool, BufferError>;

    /// Publish a live event. Delivery is best-effort.
    async fn publish(&self, id: &str, event: LiveEvent) -> Result<(), BufferError>;

    /// Subscribe to live events for `id`.
    async fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<LiveEvent>, BufferError>;

    /// Drop expired records. Returns how many were removed.
    async fn purge_expired(&self) -> usize;
}
