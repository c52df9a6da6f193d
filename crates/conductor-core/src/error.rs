//! Errors raised while decoding domain values.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A stored property is not a `[value, source]` pair.
    #[error("invalid property: {0}")]
    InvalidProperty(String),
}

pub type Result<T> = std::result::Result<T, Error>;
