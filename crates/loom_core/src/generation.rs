//! Interface to the code-generation collaborator.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::UpstreamError;
use crate::files::normalize_relative;
use crate::phase::PhaseKind;
use crate::session::SessionContext;
use crate::validate::ValidationIssue;

/// How code generation treats the existing project tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Produce the whole project
    Full,
    /// Return only files to add or modify
    Incremental,
}

/// Excerpt of an existing file sent along with an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePreview {
    pub path: String,
    pub content: String,
}

/// A file produced by the collaborator, path relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Everything a phase hands to the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRequest {
    pub session_id: String,
    pub phase: PhaseKind,
    pub mode: GenerationMode,
    pub model: String,
    pub requirements: String,
    pub context: SessionContext,
    /// Feedback driving an iteration
    pub feedback: Option<String>,
    /// Relative paths currently in the project directory
    pub existing_files: Vec<String>,
    pub file_previews: Vec<FilePreview>,
    /// Problems found by local validation
    pub issues: Vec<ValidationIssue>,
}

impl PhaseRequest {
    pub fn new(
        session_id: impl Into<String>,
        phase: PhaseKind,
        model: impl Into<String>,
        requirements: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            phase,
            mode: GenerationMode::Full,
            model: model.into(),
            requirements: requirements.into(),
            context: SessionContext::default(),
            feedback: None,
            existing_files: Vec::new(),
            file_previews: Vec::new(),
            issues: Vec::new(),
        }
    }
}

/// Output of one collaborator call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseArtifact {
    /// Short human-readable outcome
    pub summary: String,
    /// Structured output of design phases
    pub document: Option<Value>,
    pub files: Vec<GeneratedFile>,
    /// The response was cut off before every file was produced
    pub incomplete: bool,
}

impl PhaseArtifact {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn document(summary: impl Into<String>, document: Value) -> Self {
        Self {
            summary: summary.into(),
            document: Some(document),
            ..Self::default()
        }
    }

    pub fn files(summary: impl Into<String>, files: Vec<GeneratedFile>) -> Self {
        Self {
            summary: summary.into(),
            files,
            ..Self::default()
        }
    }

    pub fn incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }

    /// Check the artifact carries what the phase needs.
    pub fn check(self, phase: PhaseKind) -> Result<Self, UpstreamError> {
        if phase.requires_document() && self.document.is_none() {
            return Err(UpstreamError::InvalidResponse(format!(
                "{} returned no structured document",
                phase.label()
            )));
        }
        if phase == PhaseKind::CodeGeneration && self.files.is_empty() {
            return Err(UpstreamError::InvalidResponse(
                "code generation returned no files".to_string(),
            ));
        }
        if let Some(bad) = self.files.iter().find(|f| normalize_relative(&f.path).is_err()) {
            return Err(UpstreamError::InvalidResponse(format!(
                "unsafe file path in response: {}",
                bad.path
            )));
        }
        Ok(self)
    }
}

/// The external system that turns phase context into artifacts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeGenerationService: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run one phase. Implementations make a single attempt; retries are the
    /// caller's business.
    async fn generate(&self, request: &PhaseRequest) -> Result<PhaseArtifact, UpstreamError>;
}

/// Spaces out upstream calls for free-tier models.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until a call for `model` may be issued.
    pub async fn wait(&self, model: &str) {
        if self.interval.is_zero() || !PipelineConfig::is_free_model(model) {
            return;
        }
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                let remaining = self.interval - elapsed;
                debug!("Pacing free model {} for {:?}", model, remaining);
                tokio::time::sleep(remaining).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_design_phase_requires_document() {
        let result = PhaseArtifact::summary("done").check(PhaseKind::ArchitectureDesign);
        assert!(matches!(result, Err(UpstreamError::InvalidResponse(_))));

        let ok = PhaseArtifact::document("done", json!({})).check(PhaseKind::ArchitectureDesign);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_code_generation_requires_files() {
        assert!(PhaseArtifact::summary("none")
            .check(PhaseKind::CodeGeneration)
            .is_err());
        assert!(PhaseArtifact::summary("nothing to fix")
            .check(PhaseKind::AutoFix)
            .is_ok());
    }

    #[test]
    fn test_unsafe_paths_are_invalid_responses() {
        let artifact = PhaseArtifact::files(
            "files",
            vec![GeneratedFile::new("/etc/hosts", "127.0.0.1 localhost")],
        );
        assert!(matches!(
            artifact.check(PhaseKind::CodeGeneration),
            Err(UpstreamError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_pacer_skips_paid_models() {
        let pacer = RequestPacer::new(Duration::from_secs(60));
        let start = std::time::Instant::now();
        pacer.wait("openai/gpt-4o-mini").await;
        pacer.wait("openai/gpt-4o-mini").await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_pacer_spaces_free_models() {
        let pacer = RequestPacer::new(Duration::from_millis(50));
        let start = std::time::Instant::now();
        pacer.wait("x/y:free").await;
        pacer.wait("x/y:free").await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
