//! Common error types for offsync.

use thiserror::Error;

/// Top-level error type for offsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network-level failure talking to the remote.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote call did not complete within its budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote refused the batch.
    #[error("Batch rejected: {0}")]
    Rejected(String),

    /// The local pending queue is full.
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// Invalid engine or transport configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The sync coordinator is not running.
    #[error("Engine error: {0}")]
    Engine(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed without any
    /// change on our side.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_) | Error::Io(_))
    }

    /// Whether the remote refused the batch.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
