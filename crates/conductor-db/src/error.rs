//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// At least one build request is held by another master.
    #[error("already claimed: {0}")]
    AlreadyClaimed(String),

    /// At least one build request is not held by this master, or is already complete.
    #[error("not claimed: {0}")]
    NotClaimed(String),

    #[error("invalid record: {0}")]
    InvalidRecord(#[from] conductor_core::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;
