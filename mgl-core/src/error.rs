//! Error types for the MGL core library.

use thiserror::Error;

use crate::types::EntityId;

/// Top-level error type for all MGL operations.
///
/// Only infrastructure failures surface here. Content-related conditions
/// (empty transcripts, no matches, malformed model output) are handled with
/// empty results further up.
#[derive(Error, Debug)]
pub enum MglError {
    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied something unusable (e.g. a blank entity name).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Entity not found (or forgotten) for the given owner.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// A write kept losing to concurrent writers on the same record.
    #[error("Concurrent update conflict: {0}")]
    Contention(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for MglError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for MglError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, MglError>;
