//! Error types for the LLM client.

use std::time::Duration;

use loom_core::UpstreamError;
use loom_runner::RunnerError;
use thiserror::Error;

/// Result type alias for LLM operations.
pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM not configured: set OPENROUTER_API_KEY or OPENAI_API_KEY")]
    NotConfigured,

    #[error("Rate limited by provider: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Provider error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Network(e.to_string())
    }
}

impl From<LlmError> for UpstreamError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RateLimited {
                message,
                retry_after,
            } => UpstreamError::RateLimited {
                message,
                retry_after,
            },
            LlmError::ModelUnavailable(m) => UpstreamError::ModelUnavailable(m),
            LlmError::Api { status, body } if status < 500 => UpstreamError::ModelUnavailable(
                format!("provider rejected the request ({}): {}", status, body),
            ),
            LlmError::NotConfigured => {
                UpstreamError::ModelUnavailable("no API key configured".to_string())
            }
            other => UpstreamError::InvalidResponse(other.to_string()),
        }
    }
}

impl From<LlmError> for RunnerError {
    fn from(e: LlmError) -> Self {
        RunnerError::FixFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_mapping() {
        let limited: UpstreamError = LlmError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(3)),
        }
        .into();
        assert!(limited.is_transient());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));

        let gone: UpstreamError = LlmError::ModelUnavailable("no such model".to_string()).into();
        assert!(!gone.is_transient());

        let flaky: UpstreamError = LlmError::Api {
            status: 502,
            body: "bad gateway".to_string(),
        }
        .into();
        assert!(flaky.is_transient());

        let rejected: UpstreamError = LlmError::Api {
            status: 401,
            body: "bad key".to_string(),
        }
        .into();
        assert!(!rejected.is_transient());
    }
}
