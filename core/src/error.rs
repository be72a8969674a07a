//! Error types for repopulse

use thiserror::Error;

/// Core error type for storage and analytics operations.
///
/// Duplicate-key conflicts never surface here: both storage backends absorb
/// them through idempotent inserts.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("{0}")]
    Other(String),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
