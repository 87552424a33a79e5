//! Pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Suffix that marks rate-limited free-tier models.
pub const FREE_MODEL_SUFFIX: &str = ":free";

/// Tunables for the generation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Directory under which new sessions get their project directory
    pub output_root: PathBuf,
    /// Model used when a request does not name one
    pub default_model: String,
    /// Upstream attempts per phase, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt
    pub base_backoff_ms: u64,
    /// Minimum spacing between upstream calls for free-tier models
    pub free_model_interval_ms: u64,
    /// Whether to launch the background agent-team verification
    pub agent_team_verification: bool,
    /// How long terminal progress records are kept
    pub progress_retention_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("generated"),
            default_model: "google/gemini-2.5-pro-exp-03-25:free".to_string(),
            max_attempts: 3,
            base_backoff_ms: 2_000,
            free_model_interval_ms: 30_000,
            agent_team_verification: true,
            progress_retention_secs: 3_600,
        }
    }
}

impl PipelineConfig {
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_free_model_interval(mut self, interval: Duration) -> Self {
        self.free_model_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_agent_team_verification(mut self, enabled: bool) -> Self {
        self.agent_team_verification = enabled;
        self
    }

    /// Backoff to apply after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1 << exponent))
    }

    pub fn free_model_interval(&self) -> Duration {
        Duration::from_millis(self.free_model_interval_ms)
    }

    pub fn with_progress_retention(mut self, retention: Duration) -> Self {
        self.progress_retention_secs = retention.as_secs();
        self
    }

    pub fn progress_retention(&self) -> Duration {
        Duration::from_secs(self.progress_retention_secs)
    }

    pub fn is_free_model(model: &str) -> bool {
        model.ends_with(FREE_MODEL_SUFFIX)
    }
}
