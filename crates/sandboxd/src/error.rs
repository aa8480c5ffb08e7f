//! Error taxonomy for the engine's public operations.

use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by engine operations to the request layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or malformed identifiers. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Missing record or ownership mismatch.
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upload rejected by a byte or file-count ceiling.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serializable error body for the request layer.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub error: String,
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap an infrastructure failure on a step the caller is waiting on.
    pub fn internal_from(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Internal(format!("{context}: {err}"))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the request layer should treat this as a client error.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }

    /// Categorize an anyhow error by message.
    ///
    /// Patterns recognized:
    /// - "not found" -> NotFound
    /// - "already exists" / "unique constraint" -> Conflict
    /// - "quota exceeded" / "limit exceeded" -> QuotaExceeded
    /// - "invalid" / "must be" / "is required" -> Validation
    /// - Default -> Internal
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let msg = format!("{err:#}");
        let lower = msg.to_lowercase();

        if lower.contains("not found") {
            Self::NotFound(msg)
        } else if lower.contains("already exists") || lower.contains("unique constraint") {
            Self::Conflict(msg)
        } else if lower.contains("quota exceeded") || lower.contains("limit exceeded") {
            Self::QuotaExceeded(msg)
        } else if lower.contains("invalid")
            || lower.contains("must be")
            || lower.contains("is required")
        {
            Self::Validation(msg)
        } else {
            Self::Internal(msg)
        }
    }

    /// Log the error at a level matching its category and return the wire body.
    pub fn to_body(&self) -> ErrorBody {
        if self.is_client_error() {
            warn!(code = self.error_code(), "request rejected: {}", self);
        } else {
            error!(code = self.error_code(), "request failed: {}", self);
        }
        ErrorBody {
            code: self.error_code(),
            error: self.to_string(),
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_anyhow(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn categorizes_anyhow_messages() {
        assert!(matches!(
            CoreError::from_anyhow(anyhow!("agent 4 not found")),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            CoreError::from_anyhow(anyhow!("UNIQUE constraint failed: sessions.user_id")),
            CoreError::Conflict(_)
        ));
        assert!(matches!(
            CoreError::from_anyhow(anyhow!("invalid cpu_request '2x'")),
            CoreError::Validation(_)
        ));
        assert!(matches!(
            CoreError::from_anyhow(anyhow!("connection reset")),
            CoreError::Internal(_)
        ));
    }

    #[test]
    fn error_body_carries_code() {
        let body = CoreError::quota_exceeded("used 10 + file 5 > max 12").to_body();
        assert_eq!(body.code, "QUOTA_EXCEEDED");
        assert!(body.error.contains("max 12"));
    }
}
