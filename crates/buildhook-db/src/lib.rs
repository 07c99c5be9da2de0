//! Storage layer for buildhook.
//!
//! Provides the trigger registry, job store and work queue traits, with a
//! PostgreSQL implementation for deployments and an in-memory one for tests
//! and single-process runs.

pub mod error;
pub mod memory;
pub mod repo;
pub mod store;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use repo::*;
pub use store::Store;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
