//! The stream buffer facade: append, replay, mark-done and live subscription.
//!
//! Mutations never fail the caller. A store failure comes back as
//! [`BufferOutcome::Degraded`], which the producer logs and moves past so the
//! connected client keeps receiving tokens directly.

use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use streamweave_core::error::BufferError;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::store::{LiveEvent, Snapshot, StreamStore};

/// Consecutive store failures after which a subscription gives up.
const MAX_SUBSCRIBER_FAILURES: u32 = 3;

/// A lazily evaluated sequence of chunks.
pub type ChunkStream = BoxStream<'static, String>;

/// Result of a best-effort buffer mutation.
#[must_use = "log or explicitly discard a degraded buffer outcome"]
#[derive(Debug, Clone)]
pub enum BufferOutcome {
    Stored,
    Degraded(BufferError),
}

impl BufferOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, BufferOutcome::Stored)
    }

    /// Log a degraded outcome and carry on.
    pub fn log_degraded(self, stream_id: &str, operation: &str) {
        if let BufferOutcome::Degraded(e) = self {
            warn!(stream_id, operation, error = %e, "Stream buffer degraded, continuing without it");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferSettings {
    /// Record lifetime after the last write
    pub ttl: Duration,

    /// Upper bound on a subscriber's wait before it re-checks the store
    pub poll_interval: Duration,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Per-generation replayable chunk log over a [`StreamStore`].
#[derive(Clone)]
pub struct StreamBuffer {
    store: Arc<dyn StreamStore>,
    settings: BufferSettings,
}

impl StreamBuffer {
    pub fn new(store: Arc<dyn StreamStore>, settings: BufferSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> BufferSettings {
        self.settings
    }

    /// Durably append `chunk`, refresh the TTL and notify live subscribers.
    pub async fn append(&self, id: &str, chunk: &str) -> BufferOutcome {
        let len = match self.store.push(id, chunk.to_string(), self.settings.ttl).await {
            Ok(len) => len,
            Err(e) => return BufferOutcome::Degraded(e),
        };
        let event = LiveEvent::Chunk { index: len - 1, content: chunk.to_string() };
        if let Err(e) = self.store.publish(id, event).await {
            // Stored durably; subscribers recover it on their next poll
            debug!(stream_id = id, error = %e, "Live chunk publish failed");
        }
        BufferOutcome::Stored
    }

    /// Chunks from `offset` onward, the total count, and the record flags.
    pub async fn get_chunks(&self, id: &str, offset: usize) -> Result<Snapshot, BufferError> {
        self.store.read(id, offset).await
    }

    /// Set the terminal flag (idempotent) and notify live subscribers.
    pub async fn mark_done(&self, id: &str) -> BufferOutcome {
        match self.store.set_done(id, self.settings.ttl).await {
            Ok(flipped) => {
                if !flipped {
                    debug!(stream_id = id, "Stream already marked done");
                }
            }
            Err(e) => return BufferOutcome::Degraded(e),
        }
        if let Err(e) = self.store.publish(id, LiveEvent::Done).await {
            debug!(stream_id = id, error = %e, "Live done publish failed");
        }
        BufferOutcome::Stored
    }

    /// Chunks appended after this call, until the generation finishes.
    pub fn subscribe(&self, id: &str) -> ChunkStream {
        self.follow(id, None)
    }

    /// Every chunk from `offset` onward, buffered then live, until the
    /// generation finishes. Each chunk is yielded exactly once.
    pub fn subscribe_from(&self, id: &str, offset: usize) -> ChunkStream {
        self.follow(id, Some(offset))
    }

    fn follow(&self, id: &str, offset: Option<usize>) -> ChunkStream {
        let state = Subscription {
            store: self.store.clone(),
            id: id.to_string(),
            start: offset,
            rx: None,
            next: offset.unwrap_or(0),
            pending: VecDeque::new(),
            finished: false,
            seen: false,
            absent_since: None,
            failures: 0,
            settings: self.settings,
        };
        stream::unfold(state, |mut sub| async move {
            let chunk = sub.next_chunk().await?;
            Some((chunk, sub))
        })
        .boxed()
    }
}

/// State of one live subscription.
///
/// Live events carry their list index, so a gap, a lagged receiver or a
/// terminal event is resolved by reading the durable list from `next`.
struct Subscription {
    store: Arc<dyn StreamStore>,
    id: String,
    start: Option<usize>,
    rx: Option<broadcast::Receiver<LiveEvent>>,
    next: usize,
    pending: VecDeque<String>,
    finished: bool,
    seen: bool,
    absent_since: Option<Instant>,
    failures: u32,
    settings: BufferSettings,
}

impl Subscription {
    async fn next_chunk(&mut self) -> Option<String> {
        if self.rx.is_none() {
            self.attach().await;
        }

        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(chunk);
            }
            if self.finished {
                return None;
            }

            let Some(rx) = self.rx.as_mut() else {
                return None;
            };
            match tokio::time::timeout(self.settings.poll_interval, rx.recv()).await {
                Ok(Ok(LiveEvent::Chunk { index, content })) => {
                    if index == self.next {
                        self.next += 1;
                        self.seen = true;
                        return Some(content);
                    }
                    if index > self.next {
                        self.catch_up().await;
                    }
                    // index < next: already delivered
                }
                Ok(Ok(LiveEvent::Done)) => {
                    self.catch_up().await;
                    self.finished = true;
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!(stream_id = %self.id, skipped, "Subscriber lagged, catching up from store");
                    self.catch_up().await;
                }
                Ok(Err(RecvError::Closed)) => {
                    self.catch_up().await;
                    self.finished = true;
                }
                Err(_idle) => self.catch_up().await,
            }
        }
    }

    /// Subscribe first, then read, so nothing published in between is lost.
    async fn attach(&mut self) {
        match self.store.subscribe(&self.id).await {
            Ok(rx) => self.rx = Some(rx),
            Err(e) => {
                warn!(stream_id = %self.id, error = %e, "Cannot subscribe to stream");
                self.finished = true;
                return;
            }
        }

        match self.start {
            Some(_) => self.catch_up().await,
            None => match self.store.read(&self.id, usize::MAX).await {
                Ok(snap) => {
                    self.next = snap.total;
                    self.observe(&snap);
                }
                Err(e) => self.record_failure(e),
            },
        }
    }

    /// Pull everything from `next` out of the durable list.
    async fn catch_up(&mut self) {
        match self.store.read(&self.id, self.next).await {
            Ok(snap) => {
                self.failures = 0;
                self.next += snap.chunks.len();
                self.observe(&snap);
                self.pending.extend(snap.chunks);
            }
            Err(e) => self.record_failure(e),
        }
    }

    /// Update termination state from a durable read.
    fn observe(&mut self, snap: &Snapshot) {
        if snap.done {
            self.finished = true;
        }
        if snap.exists {
            self.seen = true;
            self.absent_since = None;
            return;
        }
        if self.seen {
            // Existed earlier, so it expired
            self.finished = true;
            return;
        }
        let since = *self.absent_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.settings.ttl {
            self.finished = true;
        }
    }

    fn record_failure(&mut self, e: BufferError) {
        self.failures += 1;
        warn!(stream_id = %self.id, failures = self.failures, error = %e, "Stream store read failed");
        if self.failures >= MAX_SUBSCRIBER_FAILURES {
            self.finished = true;
        }
    }
}
