//! Data layer error types.

use conductor_db::DbError;
use conductor_mq::MqError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("store error: {0}")]
    Db(#[from] DbError),

    #[error("event bus error: {0}")]
    Mq(#[from] MqError),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid result spec: {0}")]
    InvalidSpec(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type DataResult<T> = std::result::Result<T, DataError>;
