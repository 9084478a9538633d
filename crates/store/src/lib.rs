//! Persistence and knowledge backends for StreamWeave.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use std::sync::Arc;
use streamweave_config::{AppConfig, StorageBackend};
use streamweave_core::error::StoreError;
use streamweave_core::store::{KnowledgeSource, Persistence};
use tracing::info;

/// The two collaborator handles, backed by the same store.
#[derive(Clone)]
pub struct Stores {
    pub persistence: Arc<dyn Persistence>,
    pub knowledge: Arc<dyn KnowledgeSource>,
}

impl Stores {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: Persistence + KnowledgeSource + 'static,
    {
        Self {
            persistence: backend.clone(),
            knowledge: backend,
        }
    }

    /// Load channels and knowledge entries declared in the configuration.
    pub async fn seed(&self, config: &AppConfig) -> Result<(), StoreError> {
        for channel in &config.channels {
            self.persistence.put_channel(channel.clone()).await?;
        }
        for entry in &config.knowledge {
            self.knowledge.add_entry(entry.clone()).await?;
        }
        if !config.channels.is_empty() || !config.knowledge.is_empty() {
            info!(
                channels = config.channels.len(),
                knowledge = config.knowledge.len(),
                "Seeded store from configuration"
            );
        }
        Ok(())
    }
}

/// Open the configured backend and seed it.
pub async fn open(config: &AppConfig) -> Result<Stores, StoreError> {
    let stores = match config.storage.backend {
        StorageBackend::Memory => Stores::from_backend(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite => {
            Stores::from_backend(Arc::new(SqliteStore::new(&config.storage.sqlite_url()).await?))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageBackend::Sqlite => {
            return Err(StoreError::Storage(
                "SQLite storage requested but the `sqlite` feature is disabled".into(),
            ));
        }
    };
    info!(backend = stores.persistence.name(), "Store ready");
    stores.seed(config).await?;
    Ok(stores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamweave_core::channel::ChannelContext;
    use streamweave_core::store::KnowledgeEntry;

    #[tokio::test]
    async fn open_memory_backend_and_seed() {
        let config = AppConfig {
            channels: vec![ChannelContext { context: Some("billing".into()), ..ChannelContext::new("support") }],
            knowledge: vec![KnowledgeEntry {
                id: "k1".into(),
                title: "Refunds".into(),
                content: "14 days".into(),
                content_type: "text".into(),
                active: true,
            }],
            ..AppConfig::default()
        };

        let stores = open(&config).await.unwrap();
        assert_eq!(stores.persistence.name(), "memory");
        let channel = stores.persistence.load_channel("support").await.unwrap().unwrap();
        assert_eq!(channel.scope(), Some("billing"));
        assert!(stores.knowledge.has_active_knowledge().await.unwrap());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn open_sqlite_backend() {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Sqlite;
        config.storage.url = Some("sqlite::memory:".into());

        let stores = open(&config).await.unwrap();
        assert_eq!(stores.persistence.name(), "sqlite");
        let id = stores.persistence.create_session(None).await.unwrap();
        assert!(stores.persistence.load_session(&id, 10).await.unwrap().is_some());
    }
}
