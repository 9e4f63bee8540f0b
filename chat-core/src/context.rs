use std::sync::Arc;

use crate::config::{Config, StoreBackend};
use crate::db::{create_pool as create_db_pool, run_migrations};
use crate::redis::{create_pool as create_redis_pool, RedisPool};
use crate::store::{ChatStore, MemoryChatStore, PgChatStore};

/// Composition root: every long-lived client is built here and passed down explicitly.
#[derive(Clone)]
pub struct ChatContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn ChatStore>,
    pub redis_pool: Option<RedisPool>,
}

impl ChatContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn ChatStore> = match config.database.backend {
            StoreBackend::Postgres => {
                let db_pool = create_db_pool(&config.database).await?;
                run_migrations(&config.database).await?;
                Arc::new(PgChatStore::new(db_pool))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory chat store; data is lost on restart");
                Arc::new(MemoryChatStore::new())
            }
        };

        let redis_pool = match &config.redis.url {
            Some(url) => Some(create_redis_pool(url).await?),
            None => {
                tracing::info!("REDIS_URL not set, presence mirroring disabled");
                None
            }
        };

        Ok(ChatContext {
            config: Arc::new(config),
            store,
            redis_pool,
        })
    }

    /// Context over an already constructed store, without Redis.
    pub fn with_store(config: Config, store: Arc<dyn ChatStore>) -> Self {
        ChatContext {
            config: Arc::new(config),
            store,
            redis_pool: None,
        }
    }

    pub fn in_memory(config: Config) -> Self {
        Self::with_store(config, Arc::new(MemoryChatStore::new()))
    }
}
