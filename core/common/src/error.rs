//! Common error types for Keel.

use thiserror::Error;

/// Top-level error type for Keel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local storage operation failed. Fatal to the calling operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transient remote failure (timeout, unreachable network). Safe to retry.
    #[error("Transient sync error: {0}")]
    Transient(String),

    /// Divergent local/remote state. Requires explicit resolution.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Permanent remote failure (validation, authorization). Retrying cannot
    /// succeed without manual intervention.
    #[error("Permanent sync error: {0}")]
    Permanent(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error may resolve on its own and is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Whether this error requires manual intervention.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Permanent(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("timeout".to_string()).is_transient());
        assert!(!Error::Transient("timeout".to_string()).is_permanent());
        assert!(!Error::Storage("disk full".to_string()).is_transient());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(Error::Permanent("schema rejected".to_string()).is_permanent());
        assert!(!Error::Conflict("diverged".to_string()).is_permanent());
    }
}
