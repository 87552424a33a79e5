//! Workspace settings: `.loom/settings.json` plus environment overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use loom_core::PipelineConfig;
use loom_llm::LlmConfig;
use loom_runner::SupervisorConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SETTINGS_DIR: &str = ".loom";
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub supervisor: SupervisorConfig,
    pub llm: LlmConfig,
}

impl Settings {
    pub fn path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(SETTINGS_DIR).join(SETTINGS_FILE)
    }

    /// Load settings for `workspace_root`, falling back to defaults when no
    /// file exists, then apply environment overrides.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = Self::path(workspace_root);
        let settings = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid settings in {}", path.display()))?
        } else {
            debug!("No settings at {}, using defaults", path.display());
            Settings::default()
        };
        Ok(settings.with_env())
    }

    fn with_env(mut self) -> Self {
        if let Ok(model) = std::env::var("LOOM_MODEL") {
            if !model.trim().is_empty() {
                self.pipeline.default_model = model;
            }
        }
        self.llm = self.llm.with_env();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.pipeline.max_attempts, 3);
        assert_eq!(settings.supervisor.log_capacity, 500);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(SETTINGS_DIR)).unwrap();
        std::fs::write(
            Settings::path(dir.path()),
            r#"{"pipeline": {"outputRoot": "apps"}, "supervisor": {"idleTimeoutSecs": 0}}"#,
        )
        .unwrap();

        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.pipeline.output_root, PathBuf::from("apps"));
        assert!(settings.supervisor.idle_timeout().is_none());
        assert_eq!(settings.supervisor.grace_period_ms, 5_000);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join(SETTINGS_DIR)).unwrap();
        std::fs::write(Settings::path(dir.path()), "{not json").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }
}
