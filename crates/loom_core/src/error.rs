//! Error types for the core module.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur during core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is busy: {0}")]
    SessionBusy(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Phase failed: {phase} - {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("Upstream generation error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Unsafe file path: {0}")]
    UnsafePath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures reported by a code-generation collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::InvalidResponse(_))
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(UpstreamError::rate_limited("slow down").is_transient());
        assert!(UpstreamError::InvalidResponse("not json".into()).is_transient());
        assert!(!UpstreamError::ModelUnavailable("gone".into()).is_transient());
    }

    #[test]
    fn test_upstream_converts_into_core_error() {
        let err: CoreError = UpstreamError::ModelUnavailable("x/y".into()).into();
        assert!(err.to_string().contains("Model unavailable: x/y"));
    }
}
