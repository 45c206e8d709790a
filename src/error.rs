// src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    /// The fragment extractor does not support the call shape it was given.
    #[error("fragment extractor incompatible with call: {0}")]
    Incompatible(String),

    #[error("token decode failed: {0}")]
    Decode(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HookError>;
