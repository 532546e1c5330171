//! Error types for Engram

use thiserror::Error;

/// Main error type for Engram operations
#[derive(Error, Debug)]
pub enum EngramError {
    /// Bad caller input (empty content, unknown tier, confidence out of range).
    /// Surfaced verbatim to the caller, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown record id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-related errors (LanceDB, file system, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Embedding generation errors. Add degrades gracefully instead of
    /// surfacing this; Search propagates it.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for Engram operations
pub type Result<T> = std::result::Result<T, EngramError>;
