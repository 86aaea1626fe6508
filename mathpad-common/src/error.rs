//! Common error types for mathpad

use thiserror::Error;

/// Common result type for mathpad operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the mathpad crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),
}
