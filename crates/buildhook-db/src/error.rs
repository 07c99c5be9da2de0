//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not empty: {0}")]
    NotEmpty(String),

    #[error("invalid store url: {0}")]
    InvalidUrl(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("payload encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;
