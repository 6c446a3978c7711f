//! Error types for snowstorm

use thiserror::Error;

/// Result type alias for snowstorm operations
pub type Result<T> = std::result::Result<T, SnowstormError>;

/// Main error type for snowstorm
#[derive(Error, Debug)]
pub enum SnowstormError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue transport error: {0}")]
    Queue(String),

    #[error("Lock store error: {0}")]
    LockStore(String),

    #[error("External API error: {0}")]
    ExternalApi(String),
}
