//! Event bus error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqError {
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

pub type MqResult<T> = std::result::Result<T, MqError>;
