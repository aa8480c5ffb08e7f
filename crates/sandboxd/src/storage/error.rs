//! Object store error types.

use thiserror::Error;

/// Result type for object store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Key is empty, absolute after normalization, or escapes the store root.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage backend error.
    #[error("backend error: {0}")]
    Backend(String),

    /// No usable backend configuration.
    #[error("storage not configured: {0}")]
    NotConfigured(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::NotFound("users/1/agents/2/a.txt".to_string());
        assert_eq!(err.to_string(), "not found: users/1/agents/2/a.txt");
        assert!(err.is_not_found());
    }
}
