//! Scripted code-generation service for testing.
//!
//! Answers every phase with a canned artifact unless a response has been
//! queued for that phase, and records each request for later inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;

use crate::error::UpstreamError;
use crate::generation::{
    CodeGenerationService, GeneratedFile, GenerationMode, PhaseArtifact, PhaseRequest,
};
use crate::phase::PhaseKind;

/// Request details captured by [`MockGenerator`].
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub phase: PhaseKind,
    pub mode: GenerationMode,
    pub model: String,
    pub feedback: Option<String>,
    pub existing_files: Vec<String>,
    pub preview_paths: Vec<String>,
    pub has_architecture: bool,
}

type Scripted = Result<PhaseArtifact, UpstreamError>;

#[derive(Clone)]
pub struct MockGenerator {
    queued: Arc<RwLock<HashMap<PhaseKind, VecDeque<Scripted>>>>,
    defaults: Arc<RwLock<HashMap<PhaseKind, PhaseArtifact>>>,
    captured: Arc<RwLock<Vec<CapturedRequest>>>,
    delay: Arc<RwLock<Duration>>,
}

impl Default for MockGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGenerator {
    /// A generator producing a two-file static site.
    pub fn new() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert(
            PhaseKind::RequirementsAnalysis,
            PhaseArtifact::document(
                "static single-page app",
                json!({"needs_database": false, "needs_api": false}),
            ),
        );
        defaults.insert(
            PhaseKind::ArchitectureDesign,
            PhaseArtifact::document(
                "two files",
                json!({"files": ["index.html", "app.js"]}),
            ),
        );
        defaults.insert(
            PhaseKind::DatabaseSchemaDesign,
            PhaseArtifact::document("schema", json!({"tables": []})),
        );
        defaults.insert(
            PhaseKind::ApiDesign,
            PhaseArtifact::document("api", json!({"endpoints": []})),
        );
        defaults.insert(
            PhaseKind::CodeGeneration,
            PhaseArtifact::files(
                "generated",
                vec![
                    GeneratedFile::new("index.html", "<html><body>todo</body></html>\n"),
                    GeneratedFile::new("app.js", "localStorage.setItem('todos', '[]');\n"),
                ],
            ),
        );
        defaults.insert(
            PhaseKind::Validation,
            PhaseArtifact::document("looks fine", json!({"ok": true})),
        );

        Self {
            queued: Arc::new(RwLock::new(HashMap::new())),
            defaults: Arc::new(RwLock::new(defaults)),
            captured: Arc::new(RwLock::new(Vec::new())),
            delay: Arc::new(RwLock::new(Duration::ZERO)),
        }
    }

    /// Queue a one-shot response for the next call of `phase`.
    pub fn push(self, phase: PhaseKind, response: Scripted) -> Self {
        self.queued
            .write()
            .entry(phase)
            .or_default()
            .push_back(response);
        self
    }

    /// Replace the canned artifact for `phase`.
    pub fn with_default(self, phase: PhaseKind, artifact: PhaseArtifact) -> Self {
        self.defaults.write().insert(phase, artifact);
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = delay;
        self
    }

    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.captured.read().clone()
    }

    pub fn calls_for(&self, phase: PhaseKind) -> usize {
        self.captured
            .read()
            .iter()
            .filter(|c| c.phase == phase)
            .count()
    }

    pub fn clear_captured(&self) {
        self.captured.write().clear();
    }
}

#[async_trait]
impl CodeGenerationService for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: &PhaseRequest) -> Result<PhaseArtifact, UpstreamError> {
        self.captured.write().push(CapturedRequest {
            phase: request.phase,
            mode: request.mode,
            model: request.model.clone(),
            feedback: request.feedback.clone(),
            existing_files: request.existing_files.clone(),
            preview_paths: request
                .file_previews
                .iter()
                .map(|p| p.path.clone())
                .collect(),
            has_architecture: request.context.architecture.is_some(),
        });

        let delay = *self.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queued
            .write()
            .get_mut(&request.phase)
            .and_then(|q| q.pop_front());
        if let Some(response) = queued {
            return response;
        }

        Ok(self
            .defaults
            .read()
            .get(&request.phase)
            .cloned()
            .unwrap_or_else(|| PhaseArtifact::summary(format!("{} done", request.phase))))
    }
}
