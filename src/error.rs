//! Error types for cell storage plumbing.
//!
//! These errors never cross a cell's public operations: backends and the
//! router catch them, log them, and degrade to an absent value or a dropped
//! write. They exist so the internal fallible paths can use `?` and so the
//! optional async initializer has a typed failure channel.

use thiserror::Error;

/// Errors that can occur inside the persistence plumbing.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Cannot connect to or open a storage backend.
    #[error("connection error: {0}")]
    Connection(String),

    /// Serialization or deserialization of a persisted record failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Encryption or decryption of a secure record failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Invalid cell name.
    #[error("invalid cell name: {0}")]
    InvalidName(String),

    /// A user-supplied async initializer failed.
    #[error("initializer failed: {0}")]
    Initializer(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl StoreError {
    /// Wrap an arbitrary error as an initializer failure.
    pub fn initializer(err: impl std::fmt::Display) -> Self {
        StoreError::Initializer(err.to_string())
    }
}
