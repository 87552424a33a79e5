//! Feedback-driven iterations on an existing session.

use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::generation::GenerationMode;
use crate::orchestrator::Orchestrator;
use crate::phase::{PhaseKind, PhasePlan};
use crate::session::FeedbackEntry;

/// Keyword groups: a feedback trigger word and the path fragments it targets.
const FEEDBACK_TARGETS: &[(&[&str], &[&str])] = &[
    (&["navbar", "menu"], &["navbar", "menu", "header"]),
    (&["footer"], &["footer"]),
    (&["button", "bouton"], &["button", "btn"]),
    (&["background", "fond"], &["style", "background", "css"]),
    (&["color", "colour", "couleur"], &["style", "color", "css"]),
    (&["page"], &["index", "page", "main"]),
];

/// Options for one iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct IterationOptions {
    /// Rerun the whole pipeline instead of patching from code generation
    pub regenerate_code: bool,
}

/// Pick the existing files a piece of feedback is most likely about.
///
/// Files named in the feedback always qualify; keyword heuristics add more.
/// Without any match, HTML and CSS files are used so the model keeps the
/// current look.
pub fn target_files(feedback: &str, files: &[String]) -> Vec<String> {
    let feedback = feedback.to_lowercase();
    let fragments: Vec<&str> = FEEDBACK_TARGETS
        .iter()
        .filter(|(triggers, _)| triggers.iter().any(|t| feedback.contains(t)))
        .flat_map(|(_, fragments)| fragments.iter().copied())
        .collect();

    let mut targets: Vec<String> = files
        .iter()
        .filter(|path| {
            let lower = path.to_lowercase();
            let name = lower.rsplit('/').next().unwrap_or(&lower);
            feedback.contains(name) || fragments.iter().any(|f| lower.contains(f))
        })
        .cloned()
        .collect();

    if targets.is_empty() {
        targets = files
            .iter()
            .filter(|p| {
                let lower = p.to_lowercase();
                lower.ends_with(".html") || lower.ends_with(".css")
            })
            .cloned()
            .collect();
    }
    targets
}

/// Re-enters the orchestrator with user feedback.
///
/// Completion is signalled through the progress store only; restarting a
/// preview afterwards is the caller's job.
#[derive(Clone)]
pub struct IterationController {
    orchestrator: Orchestrator,
}

impl IterationController {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Merge feedback into a finished session and start a new run on it.
    pub fn continue_iteration(
        &self,
        session_id: &str,
        feedback: &str,
        model: Option<&str>,
        options: IterationOptions,
    ) -> CoreResult<()> {
        let feedback = feedback.trim();
        if feedback.is_empty() {
            return Err(CoreError::Validation("feedback is empty".to_string()));
        }
        if !self.orchestrator.sessions().contains(session_id) {
            return Err(CoreError::SessionNotFound(session_id.to_string()));
        }

        let (plan, mode) = if options.regenerate_code {
            (PhasePlan::full(), GenerationMode::Full)
        } else {
            (PhasePlan::incremental(), GenerationMode::Incremental)
        };
        let first = plan.next().unwrap_or(PhaseKind::CodeGeneration);
        self.orchestrator
            .progress()
            .begin_run(session_id, first.label())?;

        let model = model.map(str::to_string).filter(|m| !m.trim().is_empty());
        self.orchestrator.sessions().update(session_id, |s| {
            s.context
                .feedback
                .push(FeedbackEntry::new(feedback, model.clone()));
            if let Some(model) = model {
                s.options.model = Some(model);
            }
            s.iteration += 1;
        })?;

        info!(
            "Iterating session {} ({}): {}",
            session_id,
            if options.regenerate_code {
                "full regeneration"
            } else {
                "incremental"
            },
            feedback
        );
        self.orchestrator
            .spawn_run(session_id.to_string(), plan, mode);
        Ok(())
    }
}
