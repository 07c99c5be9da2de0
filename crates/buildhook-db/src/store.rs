//! Store handle shared by every component.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::info;

use crate::repo::{JobRepo, PgJobRepo, PgTriggerRepo, PgWorkQueue, TriggerRepo, WorkQueue};
use crate::{DbError, DbResult, MemoryStore, create_pool, run_migrations};

/// Url selecting the in-memory backend.
pub const MEMORY_URL: &str = "memory:";

/// Explicitly constructed handle to the shared state.
///
/// Cloning is cheap; all clones talk to the same backend.
#[derive(Clone)]
pub struct Store {
    pub triggers: Arc<dyn TriggerRepo>,
    pub jobs: Arc<dyn JobRepo>,
    pub queue: Arc<dyn WorkQueue>,
}

impl Store {
    /// Store backed by PostgreSQL.
    pub fn postgres(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            triggers: Arc::new(PgTriggerRepo::new(pool.clone())),
            jobs: Arc::new(PgJobRepo::new(pool.clone())),
            queue: Arc::new(PgWorkQueue::new(pool, poll_interval)),
        }
    }

    /// Store held in this process only.
    pub fn in_memory() -> Self {
        let memory = Arc::new(MemoryStore::new());
        Self {
            triggers: memory.clone(),
            jobs: memory.clone(),
            queue: memory,
        }
    }

    /// Open the store named by `url`, running migrations for PostgreSQL.
    pub async fn connect(url: &str, max_connections: u32, poll_interval: Duration) -> DbResult<Self> {
        if url == MEMORY_URL {
            info!("Using in-memory store");
            return Ok(Self::in_memory());
        }
        if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
            return Err(DbError::InvalidUrl(url.to_string()));
        }

        info!("Connecting to database...");
        let pool = create_pool(url, max_connections).await?;
        run_migrations(&pool).await?;
        info!("Database connected");

        Ok(Self::postgres(pool, poll_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let store = Store::connect(MEMORY_URL, 1, Duration::from_millis(10))
            .await
            .unwrap();
        let id = store.jobs.next_id().await.unwrap();
        assert_eq!(id.get(), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let result = Store::connect("redis://localhost", 1, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(DbError::InvalidUrl(_))));
    }
}
