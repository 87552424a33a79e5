//! Test doubles for the supervisor's collaborators.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::detect::{LaunchPlan, ProjectType, ProjectTypeDetector};
use crate::error::{RunnerError, RunnerResult};
use crate::fix::{FailureContext, FailureFixer, FilePatch};

/// Detector that returns the same plan for every directory.
#[derive(Debug, Clone)]
pub struct FixedPlanDetector {
    plan: LaunchPlan,
}

impl FixedPlanDetector {
    pub fn new(plan: LaunchPlan) -> Self {
        Self { plan }
    }

    /// Run `command` as a plain Node project.
    pub fn command(command: &str) -> Self {
        Self::new(LaunchPlan::new(ProjectType::Node, command, 3000))
    }
}

impl ProjectTypeDetector for FixedPlanDetector {
    fn detect(&self, project_dir: &Path) -> RunnerResult<LaunchPlan> {
        if !project_dir.is_dir() {
            return Err(RunnerError::ProjectNotFound(
                project_dir.display().to_string(),
            ));
        }
        Ok(self.plan.clone())
    }
}

/// Fixer that hands out scripted patches and records every failure it saw.
#[derive(Clone, Default)]
pub struct RecordingFixer {
    patches: Arc<RwLock<Vec<FilePatch>>>,
    failures: Arc<RwLock<Vec<FailureContext>>>,
}

impl RecordingFixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patch(self, patch: FilePatch) -> Self {
        self.patches.write().push(patch);
        self
    }

    pub fn failures(&self) -> Vec<FailureContext> {
        self.failures.read().clone()
    }
}

#[async_trait]
impl FailureFixer for RecordingFixer {
    async fn propose_fix(&self, failure: &FailureContext) -> RunnerResult<Vec<FilePatch>> {
        self.failures.write().push(failure.clone());
        Ok(self.patches.read().clone())
    }
}
