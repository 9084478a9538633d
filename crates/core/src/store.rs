//! Persistence and knowledge collaborators.
//!
//! The generation pipeline reads sessions and channels, and saves one
//! conversation turn per completed generation. Knowledge entries are consumed
//! by the prompt assembler (presence only) and by the `query_knowledge` tool.
//!
//! Implementations: in-memory (default, tests), SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelContext;
use crate::error::StoreError;
use crate::message::Message;

/// Session state used to seed a generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,

    /// Trailing history, most-recent-first, at most the requested window.
    #[serde(default)]
    pub history: Vec<Message>,
}

/// One completed exchange to persist against a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub user_message: String,
    pub assistant_content: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// A reference document the assistant may answer from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub title: String,
    pub content: String,

    #[serde(default = "default_content_type")]
    pub content_type: String,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_content_type() -> String {
    "text".into()
}

fn default_active() -> bool {
    true
}

/// A knowledge entry matched by a search, with its relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub entry: KnowledgeEntry,
    pub score: f32,
}

/// The best `top_k` hits of a search plus how many entries matched at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeMatches {
    pub hits: Vec<KnowledgeHit>,
    pub total: usize,
}

impl KnowledgeMatches {
    /// Rank scored entries, dropping non-matches, and keep the best `top_k`.
    pub fn rank(mut scored: Vec<KnowledgeHit>, top_k: usize) -> Self {
        scored.retain(|h| h.score > 0.0);
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        let total = scored.len();
        scored.truncate(top_k);
        Self { hits: scored, total }
    }
}

/// Session/channel reads and conversation writes.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// The backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Load a session with at most `window` trailing messages.
    async fn load_session(&self, id: &str, window: usize) -> Result<Option<SessionContext>, StoreError>;

    async fn load_channel(&self, id: &str) -> Result<Option<ChannelContext>, StoreError>;

    /// Insert or replace a channel.
    async fn put_channel(&self, channel: ChannelContext) -> Result<(), StoreError>;

    /// Create an empty session and return its id.
    async fn create_session(&self, channel_id: Option<&str>) -> Result<String, StoreError>;

    /// Persist one user turn and one assistant turn, and bump the session's
    /// message count.
    async fn save_turn(&self, turn: ConversationTurn) -> Result<(), StoreError>;
}

/// Reference material the assistant may consult.
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    async fn has_active_knowledge(&self) -> Result<bool, StoreError>;

    /// Active entries ranked by relevance to `query`, best first.
    async fn search(&self, query: &str, top_k: usize) -> Result<KnowledgeMatches, StoreError>;

    /// Number of active entries.
    async fn count_active(&self) -> Result<usize, StoreError>;

    async fn add_entry(&self, entry: KnowledgeEntry) -> Result<(), StoreError>;
}

/// Term-frequency relevance of an entry to the words of `query`.
///
/// Sum over query terms (case-insensitive) of their occurrences in the title
/// and content.
pub fn term_frequency_score(query: &str, title: &str, content: &str) -> f32 {
    let haystack = format!("{title} {content}").to_lowercase();
    query
        .to_lowercase()
        .split_whitespace()
        .map(|term| haystack.matches(term).count() as f32)
        .sum()
}
