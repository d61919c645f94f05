//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed snapshot URL.
    #[error("invalid snapshot url: {0}")]
    InvalidUrl(String),

    /// Storage backend error.
    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::NotFound("sess-1.tar.gz".to_string());
        assert_eq!(err.to_string(), "not found: sess-1.tar.gz");
    }
}
