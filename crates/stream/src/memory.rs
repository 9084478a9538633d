//! In-process stream store with TTL expiry and broadcast pub/sub.
//!
//! Expired records are invisible to reads immediately and physically removed
//! either on the next write to the same id or by the sweeper task.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use streamweave_core::error::BufferError;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::store::{LiveEvent, Snapshot, StreamStore};

struct Record {
    chunks: Vec<String>,
    done: bool,
    expires_at: Instant,
}

impl Record {
    fn new(ttl: Duration) -> Self {
        Self {
            chunks: Vec::new(),
            done: false,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// An in-memory [`StreamStore`].
pub struct InMemoryStreamStore {
    records: RwLock<HashMap<String, Record>>,
    channels: RwLock<HashMap<String, broadcast::Sender<LiveEvent>>>,
    channel_capacity: usize,
}

impl InMemoryStreamStore {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Periodically purge expired records until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                let purged = store.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "Swept expired stream records");
                }
            }
        })
    }

    /// Live record for `id`, replacing an expired one with a fresh record.
    fn live_entry<'a>(records: &'a mut HashMap<String, Record>, id: &str, ttl: Duration) -> &'a mut Record {
        let now = Instant::now();
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| Record::new(ttl));
        if record.is_expired(now) {
            *record = Record::new(ttl);
        }
        record
    }
}

impl Default for InMemoryStreamStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl StreamStore for InMemoryStreamStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(&self, id: &str, chunk: String, ttl: Duration) -> Result<usize, BufferError> {
        let mut records = self.records.write().await;
        let record = Self::live_entry(&mut records, id, ttl);
        record.chunks.push(chunk);
        record.expires_at = Instant::now() + ttl;
        Ok(record.chunks.len())
    }

    async fn read(&self, id: &str, offset: usize) -> Result<Snapshot, BufferError> {
        let records = self.records.read().await;
        let snapshot = match records.get(id) {
            Some(record) if !record.is_expired(Instant::now()) => Snapshot {
                chunks: record.chunks.iter().skip(offset).cloned().collect(),
                total: record.chunks.len(),
                done: record.done,
                exists: true,
            },
            _ => Snapshot::default(),
        };
        Ok(snapshot)
    }

    async fn set_done(&self, id: &str, ttl: Duration) -> Result<bool, BufferError> {
        let mut records = self.records.write().await;
        let record = Self::live_entry(&mut records, id, ttl);
        let flipped = !record.done;
        record.done = true;
        record.expires_at = Instant::now() + ttl;
        Ok(flipped)
    }

    async fn publish(&self, id: &str, event: LiveEvent) -> Result<(), BufferError> {
        if let Some(sender) = self.channels.read().await.get(id) {
            // No receivers is fine
            let _ = sender.send(event);
        }
        Ok(())
    }

    async fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<LiveEvent>, BufferError> {
        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(id.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0);
        Ok(sender.subscribe())
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut records = self.records.write().await;
            let expired: Vec<String> = records
                .iter()
                .filter(|(_, r)| r.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                records.remove(id);
            }
            expired
        };

        let mut channels = self.channels.write().await;
        for id in &expired {
            channels.remove(id);
        }
        // Channels nobody listens to any more
        channels.retain(|_, sender| sender.receiver_count() > 0);

        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn push_and_read_in_order() {
        let store = InMemoryStreamStore::default();
        assert_eq!(store.push("abc", "Hel".into(), TTL).await.unwrap(), 1);
        assert_eq!(store.push("abc", "lo".into(), TTL).await.unwrap(), 2);

        let snap = store.read("abc", 0).await.unwrap();
        assert_eq!(snap.chunks, vec!["Hel", "lo"]);
        assert_eq!(snap.total, 2);
        assert!(snap.exists);
        assert!(!snap.done);
    }

    #[tokio::test]
    async fn read_unknown_and_past_end() {
        let store = InMemoryStreamStore::default();
        assert_eq!(store.read("nope", 0).await.unwrap(), Snapshot::default());

        store.push("abc", "x".into(), TTL).await.unwrap();
        let snap = store.read("abc", 10).await.unwrap();
        assert!(snap.chunks.is_empty());
        assert_eq!(snap.total, 1);
    }

    #[tokio::test]
    async fn set_done_creates_record_and_is_idempotent() {
        let store = InMemoryStreamStore::default();
        assert!(store.set_done("abc", TTL).await.unwrap());
        assert!(!store.set_done("abc", TTL).await.unwrap());

        let snap = store.read("abc", 0).await.unwrap();
        assert!(snap.exists);
        assert!(snap.done);
        assert_eq!(snap.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn records_expire_after_ttl_and_writes_refresh_it() {
        let store = InMemoryStreamStore::default();
        let ttl = Duration::from_secs(10);
        store.push("abc", "a".into(), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        store.push("abc", "b".into(), ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.read("abc", 0).await.unwrap().total, 2);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!store.read("abc", 0).await.unwrap().exists);
        assert_eq!(store.purge_expired().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_after_expiry_starts_a_fresh_record() {
        let store = InMemoryStreamStore::default();
        let ttl = Duration::from_secs(1);
        store.push("abc", "old".into(), ttl).await.unwrap();
        store.set_done("abc", ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.push("abc", "new".into(), ttl).await.unwrap(), 1);
        let snap = store.read("abc", 0).await.unwrap();
        assert_eq!(snap.chunks, vec!["new"]);
        assert!(!snap.done);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_only() {
        let store = InMemoryStreamStore::default();
        // Publishing before anyone subscribes is a no-op
        store.publish("abc", LiveEvent::Done).await.unwrap();

        let mut rx = store.subscribe("abc").await.unwrap();
        store
            .publish("abc", LiveEvent::Chunk { index: 0, content: "hi".into() })
            .await
            .unwrap();
        store.publish("other", LiveEvent::Done).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), LiveEvent::Chunk { index: 0, content: "hi".into() });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_in_background() {
        let store = Arc::new(InMemoryStreamStore::default());
        let handle = store.spawn_sweeper(Duration::from_secs(5));
        store.push("abc", "a".into(), Duration::from_secs(1)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.records.read().await.is_empty());

        drop(store);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
    }
}
