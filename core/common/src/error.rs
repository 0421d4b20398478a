//! Common error types for Sanctuary sync.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local durable store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport-level failure talking to the remote store.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote store answered with a non-success status.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// A remote call did not complete within its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The component was disposed before the operation could run.
    #[error("Disposed: {0}")]
    Disposed(String),
}

impl Error {
    /// Whether the failure came from the remote side and may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Remote { .. } | Error::Timeout(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
