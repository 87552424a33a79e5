//! Error types for the runner module.

use thiserror::Error;

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while supervising preview processes.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Preview already running for session {0}")]
    AlreadyRunning(String),

    #[error("Preview session not found: {0}")]
    NotFound(String),

    #[error("Project directory not found: {0}")]
    ProjectNotFound(String),

    #[error("Could not determine how to run project: {0}")]
    Detection(String),

    #[error("Dependency install failed: {0}")]
    InstallFailed(String),

    #[error("Dependency install timed out after {0} seconds")]
    InstallTimeout(u64),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Process exited with code {} before becoming ready", .code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    ExitedEarly { code: Option<i32> },

    #[error("Automatic fix failed: {0}")]
    FixFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
