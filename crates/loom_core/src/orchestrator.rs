//! Generation pipeline orchestrator.
//!
//! `submit` registers a session and returns immediately; the phases run on a
//! background task that reports through the [`ProgressStore`]. A phase only
//! touches the session context and the project directory once its upstream
//! call has succeeded, so a failed run leaves both as the last good phase
//! left them.

use std::fs;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{CoreError, CoreResult};
use crate::files::{
    list_project_files, read_previews, FileBatch, VERIFICATION_COMPLETE, VERIFICATION_IN_PROGRESS,
};
use crate::generation::{
    CodeGenerationService, GenerationMode, PhaseArtifact, PhaseRequest, RequestPacer,
};
use crate::iteration::target_files;
use crate::phase::{PhaseKind, PhasePlan};
use crate::progress::{ProgressRecord, ProgressStore};
use crate::session::{GenerationOptions, GenerationSession, SessionContext, SessionRegistry};
use crate::validate::ProjectValidator;

/// Characters of each targeted file sent along with an iteration.
const PREVIEW_CHARS: usize = 1_000;

/// Result of a successful phase, applied to the session context afterwards.
struct PhaseOutcome {
    summary: String,
    document: Option<Value>,
    written: Vec<String>,
    incomplete: Option<bool>,
}

impl PhaseOutcome {
    fn from_artifact(artifact: PhaseArtifact) -> Self {
        Self {
            summary: artifact.summary,
            document: artifact.document,
            written: Vec::new(),
            incomplete: None,
        }
    }

    fn apply(self, phase: PhaseKind, context: &mut SessionContext) {
        context.record_document(phase, self.document);
        context.record_files(&self.written);
        if let Some(incomplete) = self.incomplete {
            context.incomplete = incomplete;
        }
    }
}

/// Drives sessions through the generation phases.
#[derive(Clone)]
pub struct Orchestrator {
    service: Arc<dyn CodeGenerationService>,
    progress: Arc<ProgressStore>,
    sessions: Arc<SessionRegistry>,
    pacer: Arc<RequestPacer>,
    config: Arc<PipelineConfig>,
}

impl Orchestrator {
    pub fn new(service: Arc<dyn CodeGenerationService>, config: PipelineConfig) -> Self {
        Self {
            service,
            progress: Arc::new(ProgressStore::new()),
            sessions: Arc::new(SessionRegistry::new()),
            pacer: Arc::new(RequestPacer::new(config.free_model_interval())),
            config: Arc::new(config),
        }
    }

    /// Share an existing progress store.
    pub fn with_progress_store(mut self, progress: Arc<ProgressStore>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current progress snapshot for a session.
    pub fn status(&self, id: &str) -> CoreResult<ProgressRecord> {
        self.progress
            .get(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    pub fn session(&self, id: &str) -> CoreResult<GenerationSession> {
        self.sessions
            .get(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    /// Forget sessions whose last run finished longer ago than the retention
    /// window. Progress and context go together so no id is half-known.
    pub fn prune_finished(&self) -> usize {
        let expired = self.progress.prune_terminal(self.config.progress_retention());
        for id in &expired {
            self.sessions.remove(id);
        }
        if !expired.is_empty() {
            info!("Forgot {} finished session(s)", expired.len());
        }
        expired.len()
    }

    /// Register a new session and start its pipeline in the background.
    pub fn submit(&self, requirements: &str, options: GenerationOptions) -> CoreResult<String> {
        let requirements = requirements.trim();
        if requirements.is_empty() {
            return Err(CoreError::Validation(
                "requirements text is empty".to_string(),
            ));
        }
        options.validate()?;
        self.prune_finished();

        let id = Uuid::new_v4().to_string();
        let target_dir = options
            .target_dir
            .clone()
            .unwrap_or_else(|| self.config.output_root.join(&id));
        self.sessions
            .insert(GenerationSession::new(&id, target_dir, requirements, options));
        self.progress.register(&id)?;
        self.progress
            .begin_run(&id, PhaseKind::RequirementsAnalysis.label())?;

        info!("Submitted generation session {}", id);
        self.spawn_run(id.clone(), PhasePlan::full(), GenerationMode::Full);
        Ok(id)
    }

    /// Run `plan` for a session already marked running.
    pub(crate) fn spawn_run(
        &self,
        id: String,
        plan: PhasePlan,
        mode: GenerationMode,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run(&id, plan, mode).await })
    }

    async fn run(&self, id: &str, mut plan: PhasePlan, mode: GenerationMode) {
        let Some(session) = self.sessions.get(id) else {
            warn!("Session {} vanished before its run started", id);
            return;
        };
        // A plan that re-runs analysis is narrowed once the new analysis is in
        if !plan.remaining().contains(&PhaseKind::RequirementsAnalysis) {
            narrow_plan(&mut plan, &session);
        }

        while let Some(phase) = plan.next() {
            let (index, total) = plan.position();
            info!(
                "Executing phase [{}/{}]: {} (session {})",
                index,
                total,
                phase.label(),
                id
            );
            self.progress.advance(id, plan.percent(), phase.label());

            let session = match self.enter_phase(id, phase) {
                Ok(session) => session,
                Err(e) => {
                    self.progress.fail(id, e.to_string());
                    return;
                }
            };

            match self.execute_phase(&session, phase, mode).await {
                Ok(outcome) => {
                    debug!("{} finished: {}", phase.label(), outcome.summary);
                    if let Err(e) = self
                        .sessions
                        .update(id, |s| outcome.apply(phase, &mut s.context))
                    {
                        self.progress.fail(id, e.to_string());
                        return;
                    }
                    plan.mark_completed(phase);
                    if let Some(session) = self.sessions.get(id) {
                        narrow_plan(&mut plan, &session);
                    }
                    self.progress.advance(id, plan.percent(), phase.label());
                }
                Err(e) => {
                    error!("{} failed for session {}: {}", phase.label(), id, e);
                    self.progress
                        .fail(id, format!("{} failed: {}", phase.label(), e));
                    return;
                }
            }
        }

        self.finish(id);
    }

    fn enter_phase(&self, id: &str, phase: PhaseKind) -> CoreResult<GenerationSession> {
        self.sessions.update(id, |s| s.phase = Some(phase))?;
        self.session(id)
    }

    async fn execute_phase(
        &self,
        session: &GenerationSession,
        phase: PhaseKind,
        mode: GenerationMode,
    ) -> CoreResult<PhaseOutcome> {
        let mut request = self.build_request(session, phase, mode)?;

        match phase {
            PhaseKind::CodeGeneration => {
                let artifact = self.call_with_retry(&request).await?;
                let written =
                    FileBatch::from_generated(&session.target_dir, &artifact.files)?.commit()?;
                info!("Code generation wrote {} file(s)", written.len());
                Ok(PhaseOutcome {
                    summary: artifact.summary,
                    document: None,
                    written,
                    incomplete: Some(artifact.incomplete),
                })
            }
            PhaseKind::Validation => {
                let report = ProjectValidator::validate(
                    &session.target_dir,
                    &session.context.planned_files(),
                )?;
                request.issues = report.issues.clone();
                let artifact = self.call_with_retry(&request).await?;
                let document = json!({
                    "issues": report.issues,
                    "files_checked": report.files_checked,
                    "review": artifact.document,
                    "summary": artifact.summary,
                });
                Ok(PhaseOutcome {
                    summary: artifact.summary,
                    document: Some(document),
                    written: Vec::new(),
                    incomplete: None,
                })
            }
            PhaseKind::AutoFix => {
                let report = ProjectValidator::validate(
                    &session.target_dir,
                    &session.context.planned_files(),
                )?;
                if report.is_clean() && !session.context.incomplete {
                    return Ok(PhaseOutcome {
                        summary: "nothing to fix".to_string(),
                        document: None,
                        written: Vec::new(),
                        incomplete: None,
                    });
                }
                let affected: Vec<String> =
                    report.issues.iter().map(|i| i.path.clone()).collect();
                request.file_previews =
                    read_previews(&session.target_dir, &affected, PREVIEW_CHARS);
                request.issues = report.issues;
                let artifact = self.call_with_retry(&request).await?;
                let written =
                    FileBatch::from_generated(&session.target_dir, &artifact.files)?.commit()?;
                info!("Auto-fix rewrote {} file(s)", written.len());
                Ok(PhaseOutcome {
                    summary: artifact.summary,
                    document: None,
                    written,
                    incomplete: Some(artifact.incomplete),
                })
            }
            _ => {
                let artifact = self.call_with_retry(&request).await?;
                Ok(PhaseOutcome::from_artifact(artifact))
            }
        }
    }

    fn build_request(
        &self,
        session: &GenerationSession,
        phase: PhaseKind,
        mode: GenerationMode,
    ) -> CoreResult<PhaseRequest> {
        let mut request = PhaseRequest::new(
            &session.id,
            phase,
            session.model(&self.config.default_model),
            &session.requirements,
        );
        request.mode = mode;
        request.context = session.context.clone();
        request.feedback = session.context.latest_feedback().map(|f| f.text.clone());

        if phase.produces_files()
            || phase == PhaseKind::Validation
            || mode == GenerationMode::Incremental
        {
            request.existing_files = list_project_files(&session.target_dir)?;
        }
        if phase == PhaseKind::CodeGeneration && mode == GenerationMode::Incremental {
            let feedback = request.feedback.as_deref().unwrap_or_default();
            let targets = target_files(feedback, &request.existing_files);
            request.file_previews = read_previews(&session.target_dir, &targets, PREVIEW_CHARS);
        }
        Ok(request)
    }

    /// Call the collaborator, retrying transient failures with backoff.
    async fn call_with_retry(&self, request: &PhaseRequest) -> CoreResult<PhaseArtifact> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.pacer.wait(&request.model).await;

            let result = self
                .service
                .generate(request)
                .await
                .and_then(|artifact| artifact.check(request.phase));

            match result {
                Ok(artifact) => return Ok(artifact),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self
                        .config
                        .backoff_for(attempt)
                        .max(e.retry_after().unwrap_or_default());
                    warn!(
                        "{} upstream error on {} (attempt {}/{}), retrying in {:?}: {}",
                        self.service.name(),
                        request.phase.label(),
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(CoreError::Upstream(e)),
            }
        }
    }

    fn finish(&self, id: &str) {
        if let Some(session) = self.sessions.get(id) {
            match ProjectValidator::validate(&session.target_dir, &[]) {
                Ok(report) => {
                    let empty = report.empty_files();
                    if !empty.is_empty() {
                        warn!("Session {} finished with {} empty file(s)", id, empty.len());
                    }
                    if let Err(e) = self.sessions.update(id, |s| s.context.empty_files = empty) {
                        warn!("Could not record result summary for {}: {}", id, e);
                    }
                }
                Err(e) => warn!("Could not inspect output of {}: {}", id, e),
            }
        }

        self.progress.complete(id);
        info!("Generation session {} completed", id);

        if self.config.agent_team_verification {
            self.spawn_verification(id);
        }
    }

    /// Launch agent-team verification without holding up the session.
    fn spawn_verification(&self, id: &str) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.verify(&session).await {
                warn!("Agent-team verification for {} failed: {}", session.id, e);
            }
        });
    }

    async fn verify(&self, session: &GenerationSession) -> CoreResult<()> {
        let in_progress = session.target_dir.join(VERIFICATION_IN_PROGRESS);
        fs::create_dir_all(&session.target_dir)?;
        fs::write(
            &in_progress,
            format!("started_at: {}\n", Utc::now().to_rfc3339()),
        )?;

        let request = self.build_request(
            session,
            PhaseKind::AgentTeamVerification,
            GenerationMode::Full,
        )?;
        let (status, summary) = match self.call_with_retry(&request).await {
            Ok(artifact) => ("passed", artifact.summary),
            Err(e) => ("failed", e.to_string()),
        };

        fs::write(
            session.target_dir.join(VERIFICATION_COMPLETE),
            format!(
                "status: {}\ncompleted_at: {}\n\n{}\n",
                status,
                Utc::now().to_rfc3339(),
                summary
            ),
        )?;
        if let Err(e) = fs::remove_file(&in_progress) {
            debug!("Could not remove {:?}: {}", in_progress, e);
        }
        info!("Agent-team verification for {} {}", session.id, status);
        Ok(())
    }
}

fn narrow_plan(plan: &mut PhasePlan, session: &GenerationSession) {
    plan.narrow(
        session.context.needs_data_layer(&session.options),
        session.context.needs_service_layer(&session.options),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::generation::MockCodeGenerationService;
    use crate::session::SessionStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config(root: &std::path::Path) -> PipelineConfig {
        PipelineConfig::default()
            .with_output_root(root)
            .with_base_backoff(Duration::from_millis(1))
            .with_free_model_interval(Duration::ZERO)
            .with_agent_team_verification(false)
    }

    async fn wait_terminal(orchestrator: &Orchestrator, id: &str) -> ProgressRecord {
        for _ in 0..500 {
            let record = orchestrator.status(id).unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} did not finish", id);
    }

    #[tokio::test]
    async fn test_model_unavailable_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let mut service = MockCodeGenerationService::new();
        service.expect_name().return_const("mocked".to_string());
        service
            .expect_generate()
            .times(1)
            .returning(|_| Err(UpstreamError::ModelUnavailable("no such model".into())));

        let orchestrator = Orchestrator::new(Arc::new(service), fast_config(dir.path()));
        let id = orchestrator
            .submit("a to-do list", GenerationOptions::default())
            .unwrap();

        let record = wait_terminal(&orchestrator, &id).await;
        assert_eq!(record.status, SessionStatus::Failed);
        assert!(record.error.unwrap().contains("no such model"));
    }

    #[tokio::test]
    async fn test_malformed_document_exhausts_attempts() {
        let dir = TempDir::new().unwrap();
        let mut service = MockCodeGenerationService::new();
        service.expect_name().return_const("mocked".to_string());
        service
            .expect_generate()
            .times(3)
            .returning(|_| Ok(PhaseArtifact::summary("prose instead of JSON")));

        let orchestrator = Orchestrator::new(Arc::new(service), fast_config(dir.path()));
        let id = orchestrator
            .submit("a to-do list", GenerationOptions::default())
            .unwrap();

        let record = wait_terminal(&orchestrator, &id).await;
        assert_eq!(record.status, SessionStatus::Failed);
        assert_eq!(record.current_step, "Requirements Analysis");
        assert!(orchestrator.session(&id).unwrap().context.analysis.is_none());
    }

    #[test]
    fn test_submit_rejects_blank_requirements() {
        let service = MockCodeGenerationService::new();
        let orchestrator = Orchestrator::new(Arc::new(service), PipelineConfig::default());
        let result = orchestrator.submit("   ", GenerationOptions::default());
        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert!(orchestrator.sessions().is_empty());
        assert!(orchestrator.progress().is_empty());
    }
}
