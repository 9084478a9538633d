//! SQLite backend.
//!
//! Tables:
//! - `channels` — assistant configuration per channel
//! - `sessions` — session ids, their channel and running message count
//! - `messages` — one row per user or assistant turn
//! - `knowledge` — reference entries searched by the knowledge tool

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use streamweave_core::channel::ChannelContext;
use streamweave_core::error::StoreError;
use streamweave_core::message::{Message, Role};
use streamweave_core::store::{
    ConversationTurn, KnowledgeEntry, KnowledgeHit, KnowledgeMatches, KnowledgeSource, Persistence,
    SessionContext, term_frequency_score,
};
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and run migrations.
    ///
    /// `sqlite::memory:` gives an ephemeral database for tests.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite URL: {e}")))?
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to :memory: is a separate database
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {url}");
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            (
                "channels table",
                r#"
                CREATE TABLE IF NOT EXISTS channels (
                    id                  TEXT PRIMARY KEY,
                    name                TEXT NOT NULL DEFAULT '',
                    system_prompt       TEXT,
                    personality_name    TEXT,
                    context             TEXT,
                    context_description TEXT,
                    provider            TEXT,
                    model               TEXT
                )
                "#,
            ),
            (
                "sessions table",
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id            TEXT PRIMARY KEY,
                    channel_id    TEXT,
                    message_count INTEGER NOT NULL DEFAULT 0,
                    created_at    TEXT NOT NULL,
                    updated_at    TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages table",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    iid        INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    role       TEXT NOT NULL,
                    content    TEXT NOT NULL,
                    model      TEXT,
                    created_at TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages index",
                "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, iid DESC)",
            ),
            (
                "knowledge table",
                r#"
                CREATE TABLE IF NOT EXISTS knowledge (
                    id           TEXT PRIMARY KEY,
                    title        TEXT NOT NULL,
                    content      TEXT NOT NULL,
                    content_type TEXT NOT NULL DEFAULT 'text',
                    active       INTEGER NOT NULL DEFAULT 1
                )
                "#,
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_channel(row: &SqliteRow) -> Result<ChannelContext, StoreError> {
        let column = |e: sqlx::Error| StoreError::QueryFailed(format!("channel row: {e}"));
        Ok(ChannelContext {
            id: row.try_get("id").map_err(column)?,
            name: row.try_get("name").map_err(column)?,
            system_prompt: row.try_get("system_prompt").map_err(column)?,
            personality_name: row.try_get("personality_name").map_err(column)?,
            context: row.try_get("context").map_err(column)?,
            context_description: row.try_get("context_description").map_err(column)?,
            provider: row.try_get("provider").map_err(column)?,
            model: row.try_get("model").map_err(column)?,
        })
    }

    fn row_to_knowledge(row: &SqliteRow) -> Result<KnowledgeEntry, StoreError> {
        let column = |e: sqlx::Error| StoreError::QueryFailed(format!("knowledge row: {e}"));
        Ok(KnowledgeEntry {
            id: row.try_get("id").map_err(column)?,
            title: row.try_get("title").map_err(column)?,
            content: row.try_get("content").map_err(column)?,
            content_type: row.try_get("content_type").map_err(column)?,
            active: row.try_get::<i64, _>("active").map_err(column)? != 0,
        })
    }

    /// Total messages recorded against a session.
    pub async fn message_count(&self, session_id: &str) -> Result<Option<usize>, StoreError> {
        let row = sqlx::query("SELECT message_count FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("message count: {e}")))?;
        row.map(|r| {
            r.try_get::<i64, _>("message_count")
                .map(|n| n as usize)
                .map_err(|e| StoreError::QueryFailed(format!("message_count column: {e}")))
        })
        .transpose()
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load_session(&self, id: &str, window: usize) -> Result<Option<SessionContext>, StoreError> {
        let Some(session) = sqlx::query("SELECT channel_id FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("load session: {e}")))?
        else {
            return Ok(None);
        };
        let channel_id: Option<String> = session
            .try_get("channel_id")
            .map_err(|e| StoreError::QueryFailed(format!("channel_id column: {e}")))?;

        let rows = sqlx::query(
            "SELECT role, content FROM messages WHERE session_id = ?1 ORDER BY iid DESC LIMIT ?2",
        )
        .bind(id)
        .bind(window as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("load history: {e}")))?;

        let mut history = Vec::with_capacity(rows.len());
        for row in &rows {
            let role: String = row
                .try_get("role")
                .map_err(|e| StoreError::QueryFailed(format!("role column: {e}")))?;
            let content: String = row
                .try_get("content")
                .map_err(|e| StoreError::QueryFailed(format!("content column: {e}")))?;
            let message = match Role::parse(&role) {
                Some(Role::Assistant) => Message::assistant(content),
                Some(Role::User) => Message::user(content),
                _ => {
                    debug!(session_id = id, role, "Skipping stored message with unexpected role");
                    continue;
                }
            };
            history.push(message);
        }

        Ok(Some(SessionContext {
            id: id.to_string(),
            channel_id,
            history,
        }))
    }

    async fn load_channel(&self, id: &str) -> Result<Option<ChannelContext>, StoreError> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("load channel: {e}")))?;
        row.as_ref().map(Self::row_to_channel).transpose()
    }

    async fn put_channel(&self, channel: ChannelContext) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, name, system_prompt, personality_name, context, context_description, provider, model)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                system_prompt = excluded.system_prompt,
                personality_name = excluded.personality_name,
                context = excluded.context,
                context_description = excluded.context_description,
                provider = excluded.provider,
                model = excluded.model
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(&channel.system_prompt)
        .bind(&channel.personality_name)
        .bind(&channel.context)
        .bind(&channel.context_description)
        .bind(&channel.provider)
        .bind(&channel.model)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("Channel upsert failed: {e}")))?;
        Ok(())
    }

    async fn create_session(&self, channel_id: Option<&str>) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, channel_id, message_count, created_at, updated_at) VALUES (?1, ?2, 0, ?3, ?3)",
        )
        .bind(&id)
        .bind(channel_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("Session insert failed: {e}")))?;
        Ok(id)
    }

    async fn save_turn(&self, turn: ConversationTurn) -> Result<(), StoreError> {
        let created_at = turn.created_at.to_rfc3339();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("Begin failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, channel_id, message_count, created_at, updated_at)
            VALUES (?1, NULL, 2, ?2, ?2)
            ON CONFLICT(id) DO UPDATE SET
                message_count = message_count + 2,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&turn.session_id)
        .bind(&created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("Session update failed: {e}")))?;

        for (role, content) in [
            (Role::User, &turn.user_message),
            (Role::Assistant, &turn.assistant_content),
        ] {
            sqlx::query(
                "INSERT INTO messages (session_id, role, content, model, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&turn.session_id)
            .bind(role.as_str())
            .bind(content)
            .bind(&turn.model)
            .bind(&created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("Message insert failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("Commit failed: {e}")))?;
        debug!(session_id = %turn.session_id, "Saved conversation turn");
        Ok(())
    }
}

#[async_trait]
impl KnowledgeSource for SqliteStore {
    async fn has_active_knowledge(&self) -> Result<bool, StoreError> {
        Ok(self.count_active().await? > 0)
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<KnowledgeMatches, StoreError> {
        let rows = sqlx::query("SELECT * FROM knowledge WHERE active = 1")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Knowledge scan: {e}")))?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let entry = Self::row_to_knowledge(row)?;
            scored.push(KnowledgeHit {
                score: term_frequency_score(query, &entry.title, &entry.content),
                entry,
            });
        }
        Ok(KnowledgeMatches::rank(scored, top_k))
    }

    async fn count_active(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM knowledge WHERE active = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Knowledge count: {e}")))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| StoreError::QueryFailed(format!("count column: {e}")))?;
        Ok(n as usize)
    }

    async fn add_entry(&self, entry: KnowledgeEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO knowledge (id, title, content, content_type, active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                content_type = excluded.content_type,
                active = excluded.active
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.title)
        .bind(&entry.content)
        .bind(&entry.content_type)
        .bind(entry.active as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("Knowledge upsert failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn turn(session_id: &str, user: &str, assistant: &str) -> ConversationTurn {
        ConversationTurn {
            session_id: session_id.into(),
            user_message: user.into(),
            assistant_content: assistant.into(),
            model: "gpt-4o-mini".into(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn session_round_trip() {
        let store = store().await;
        let id = store.create_session(Some("support")).await.unwrap();
        store.save_turn(turn(&id, "hi", "hello")).await.unwrap();
        store.save_turn(turn(&id, "how are you", "fine")).await.unwrap();

        let session = store.load_session(&id, 3).await.unwrap().unwrap();
        assert_eq!(session.channel_id.as_deref(), Some("support"));
        let contents: Vec<_> = session.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["fine", "how are you", "hello"]);
        assert_eq!(session.history[0].role, Role::Assistant);
        assert_eq!(store.message_count(&id).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn missing_rows_are_none() {
        let store = store().await;
        assert!(store.load_session("nope", 10).await.unwrap().is_none());
        assert!(store.load_channel("nope").await.unwrap().is_none());
        assert_eq!(store.message_count("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn channel_upsert() {
        let store = store().await;
        let channel = ChannelContext {
            name: "Billing".into(),
            context: Some("billing".into()),
            personality_name: Some("Penny".into()),
            ..ChannelContext::new("c1")
        };
        store.put_channel(channel.clone()).await.unwrap();
        assert_eq!(store.load_channel("c1").await.unwrap(), Some(channel));

        let renamed = ChannelContext { name: "Accounts".into(), ..ChannelContext::new("c1") };
        store.put_channel(renamed.clone()).await.unwrap();
        assert_eq!(store.load_channel("c1").await.unwrap(), Some(renamed));
    }

    #[tokio::test]
    async fn knowledge_search_and_counts() {
        let store = store().await;
        assert!(!store.has_active_knowledge().await.unwrap());

        for (id, title, content, active) in [
            ("k1", "Refund policy", "Refunds are issued within 14 days.", true),
            ("k2", "Shipping", "Orders ship in two days.", true),
            ("k3", "Legacy refunds", "refund", false),
        ] {
            store
                .add_entry(KnowledgeEntry {
                    id: id.into(),
                    title: title.into(),
                    content: content.into(),
                    content_type: "text".into(),
                    active,
                })
                .await
                .unwrap();
        }

        assert!(store.has_active_knowledge().await.unwrap());
        assert_eq!(store.count_active().await.unwrap(), 2);

        let matches = store.search("refund days", 1).await.unwrap();
        assert_eq!(matches.total, 2);
        assert_eq!(matches.hits.len(), 1);
        assert_eq!(matches.hits[0].entry.id, "k1");
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("sw.db").display());

        let id = {
            let store = SqliteStore::new(&url).await.unwrap();
            let id = store.create_session(None).await.unwrap();
            store.save_turn(turn(&id, "q", "a")).await.unwrap();
            id
        };

        let store = SqliteStore::new(&url).await.unwrap();
        let session = store.load_session(&id, 10).await.unwrap().unwrap();
        assert_eq!(session.history.len(), 2);
    }
}
