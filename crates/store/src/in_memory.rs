//! In-memory backend — the default, and what the tests run against.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use streamweave_core::channel::ChannelContext;
use streamweave_core::error::StoreError;
use streamweave_core::message::Message;
use streamweave_core::store::{
    ConversationTurn, KnowledgeEntry, KnowledgeHit, KnowledgeMatches, KnowledgeSource, Persistence,
    SessionContext, term_frequency_score,
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct SessionRecord {
    channel_id: Option<String>,
    messages: Vec<Message>,
    message_count: usize,
}

/// Sessions, channels and knowledge held in process memory.
pub struct InMemoryStore {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    channels: Arc<RwLock<HashMap<String, ChannelContext>>>,
    knowledge: Arc<RwLock<Vec<KnowledgeEntry>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            knowledge: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Total messages recorded against a session.
    pub async fn message_count(&self, session_id: &str) -> Option<usize> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.message_count)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load_session(&self, id: &str, window: usize) -> Result<Option<SessionContext>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).map(|record| SessionContext {
            id: id.to_string(),
            channel_id: record.channel_id.clone(),
            history: record.messages.iter().rev().take(window).cloned().collect(),
        }))
    }

    async fn load_channel(&self, id: &str) -> Result<Option<ChannelContext>, StoreError> {
        Ok(self.channels.read().await.get(id).cloned())
    }

    async fn put_channel(&self, channel: ChannelContext) -> Result<(), StoreError> {
        self.channels.write().await.insert(channel.id.clone(), channel);
        Ok(())
    }

    async fn create_session(&self, channel_id: Option<&str>) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let record = SessionRecord {
            channel_id: channel_id.map(str::to_string),
            ..SessionRecord::default()
        };
        self.sessions.write().await.insert(id.clone(), record);
        Ok(id)
    }

    async fn save_turn(&self, turn: ConversationTurn) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.entry(turn.session_id).or_default();
        record.messages.push(Message::user(turn.user_message));
        record.messages.push(Message::assistant(turn.assistant_content));
        record.message_count += 2;
        Ok(())
    }
}

#[async_trait]
impl KnowledgeSource for InMemoryStore {
    async fn has_active_knowledge(&self) -> Result<bool, StoreError> {
        Ok(self.knowledge.read().await.iter().any(|e| e.active))
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<KnowledgeMatches, StoreError> {
        let knowledge = self.knowledge.read().await;
        let scored = knowledge
            .iter()
            .filter(|e| e.active)
            .map(|e| KnowledgeHit {
                score: term_frequency_score(query, &e.title, &e.content),
                entry: e.clone(),
            })
            .collect();
        Ok(KnowledgeMatches::rank(scored, top_k))
    }

    async fn count_active(&self) -> Result<usize, StoreError> {
        Ok(self.knowledge.read().await.iter().filter(|e| e.active).count())
    }

    async fn add_entry(&self, entry: KnowledgeEntry) -> Result<(), StoreError> {
        let mut knowledge = self.knowledge.write().await;
        match knowledge.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => knowledge.push(entry),
        }
        Ok(())
    }
}
