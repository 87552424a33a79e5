//! Generation sessions and their accumulated context.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::phase::PhaseKind;

/// Lifecycle status of a generation session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created but no phase scheduled yet
    Pending,
    /// A run or iteration is in flight
    Running,
    /// Last run finished every phase
    Completed,
    /// Last run stopped at a phase
    Failed,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Options accompanying a submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationOptions {
    /// Plain HTML/CSS/JS output without a backend
    pub static_site: bool,
    /// Force an API service layer
    pub api_service: bool,
    /// Force a database layer
    pub requires_database: bool,
    /// Model override for this session
    pub model: Option<String>,
    /// Project directory; defaults to `<output_root>/<session id>`
    pub target_dir: Option<PathBuf>,
}

impl GenerationOptions {
    pub fn static_site() -> Self {
        Self {
            static_site: true,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_target_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_dir = Some(dir.into());
        self
    }

    /// Reject flag combinations that cannot be satisfied together.
    pub fn validate(&self) -> CoreResult<()> {
        if self.static_site && self.api_service {
            return Err(CoreError::Validation(
                "a static site cannot also provide an API service".to_string(),
            ));
        }
        if self.static_site && self.requires_database {
            return Err(CoreError::Validation(
                "a static site cannot require a database".to_string(),
            ));
        }
        Ok(())
    }
}

/// One piece of user feedback merged by an iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub text: String,
    pub model: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl FeedbackEntry {
    pub fn new(text: impl Into<String>, model: Option<String>) -> Self {
        Self {
            text: text.into(),
            model,
            submitted_at: Utc::now(),
        }
    }
}

/// Structured output accumulated across phases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    pub analysis: Option<Value>,
    pub architecture: Option<Value>,
    pub schema: Option<Value>,
    pub api_spec: Option<Value>,
    pub validation: Option<Value>,
    /// Feedback merged by iterations, oldest first
    pub feedback: Vec<FeedbackEntry>,
    /// Relative paths written by file-producing phases
    pub generated_files: Vec<String>,
    /// Files still empty after the last run
    pub empty_files: Vec<String>,
    /// Last code generation response was cut short
    pub incomplete: bool,
}

impl SessionContext {
    /// Whether a data layer is needed. Unknown counts as needed.
    pub fn needs_data_layer(&self, options: &GenerationOptions) -> bool {
        if options.requires_database {
            return true;
        }
        if options.static_site {
            return false;
        }
        self.analysis_flag("needs_database").unwrap_or(true)
    }

    /// Whether a service layer is needed. Unknown counts as needed.
    pub fn needs_service_layer(&self, options: &GenerationOptions) -> bool {
        if options.api_service {
            return true;
        }
        if options.static_site {
            return false;
        }
        self.analysis_flag("needs_api").unwrap_or(true)
    }

    fn analysis_flag(&self, key: &str) -> Option<bool> {
        self.analysis.as_ref()?.get(key)?.as_bool()
    }

    /// Files the architecture document says the project should contain.
    pub fn planned_files(&self) -> Vec<String> {
        let Some(files) = self
            .architecture
            .as_ref()
            .and_then(|a| a.get("files"))
            .and_then(|f| f.as_array())
        else {
            return Vec::new();
        };

        files
            .iter()
            .filter_map(|entry| match entry {
                Value::String(path) => Some(path.clone()),
                Value::Object(map) => map.get("path").and_then(|p| p.as_str()).map(String::from),
                _ => None,
            })
            .collect()
    }

    pub fn latest_feedback(&self) -> Option<&FeedbackEntry> {
        self.feedback.last()
    }

    /// Store the document a design phase produced.
    pub fn record_document(&mut self, phase: PhaseKind, document: Option<Value>) {
        let slot = match phase {
            PhaseKind::RequirementsAnalysis => &mut self.analysis,
            PhaseKind::ArchitectureDesign => &mut self.architecture,
            PhaseKind::DatabaseSchemaDesign => &mut self.schema,
            PhaseKind::ApiDesign => &mut self.api_spec,
            PhaseKind::Validation => &mut self.validation,
            _ => return,
        };
        if document.is_some() {
            *slot = document;
        }
    }

    pub fn record_files(&mut self, written: &[String]) {
        for path in written {
            if !self.generated_files.contains(path) {
                self.generated_files.push(path.clone());
            }
        }
        self.generated_files.sort();
    }
}

/// A unit of generation work addressed by one id across iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: String,
    pub target_dir: PathBuf,
    pub requirements: String,
    pub options: GenerationOptions,
    pub context: SessionContext,
    /// Last phase entered
    pub phase: Option<PhaseKind>,
    /// Number of iterations applied on top of the first run
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationSession {
    pub fn new(
        id: impl Into<String>,
        target_dir: PathBuf,
        requirements: impl Into<String>,
        options: GenerationOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            target_dir,
            requirements: requirements.into(),
            options,
            context: SessionContext::default(),
            phase: None,
            iteration: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Model for upstream calls: latest feedback override, then session option.
    pub fn model<'a>(&'a self, default_model: &'a str) -> &'a str {
        self.context
            .latest_feedback()
            .and_then(|f| f.model.as_deref())
            .or(self.options.model.as_deref())
            .unwrap_or(default_model)
    }
}

/// Registry of every session known to this process.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, GenerationSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: GenerationSession) {
        self.sessions.write().insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<GenerationSession> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<GenerationSession> {
        self.sessions.write().remove(id)
    }

    /// Apply a mutation to a session in place.
    pub fn update<F>(&self, id: &str, mutate: F) -> CoreResult<()>
    where
        F: FnOnce(&mut GenerationSession),
    {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))?;
        mutate(session);
        session.updated_at = Utc::now();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
