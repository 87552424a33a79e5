//! Pipeline phases and progress accounting.
//!
//! A generation run walks an ordered list of phases. Two of them are
//! conditional: database schema design only runs when the application has a
//! data layer, and API design only when it has a service layer. Whether those
//! layers exist is not always known up front, so a [`PhasePlan`] starts out
//! assuming they are needed and is narrowed once the requirements analysis
//! says otherwise. The plan only ever shrinks, which keeps the reported
//! percentage from moving backwards.

use serde::{Deserialize, Serialize};

/// One step of the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    RequirementsAnalysis,
    ArchitectureDesign,
    DatabaseSchemaDesign,
    ApiDesign,
    CodeGeneration,
    Validation,
    AutoFix,
    /// Runs in the background after completion; never part of a plan
    AgentTeamVerification,
}

impl PhaseKind {
    /// Phases of a full run, in order.
    pub const PIPELINE: [PhaseKind; 7] = [
        PhaseKind::RequirementsAnalysis,
        PhaseKind::ArchitectureDesign,
        PhaseKind::DatabaseSchemaDesign,
        PhaseKind::ApiDesign,
        PhaseKind::CodeGeneration,
        PhaseKind::Validation,
        PhaseKind::AutoFix,
    ];

    /// Phases re-run by an incremental iteration.
    pub const INCREMENTAL: [PhaseKind; 3] = [
        PhaseKind::CodeGeneration,
        PhaseKind::Validation,
        PhaseKind::AutoFix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequirementsAnalysis => "requirements_analysis",
            Self::ArchitectureDesign => "architecture_design",
            Self::DatabaseSchemaDesign => "database_schema_design",
            Self::ApiDesign => "api_design",
            Self::CodeGeneration => "code_generation",
            Self::Validation => "validation",
            Self::AutoFix => "auto_fix",
            Self::AgentTeamVerification => "agent_team_verification",
        }
    }

    /// Human-readable label used as the current-step text.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RequirementsAnalysis => "Requirements Analysis",
            Self::ArchitectureDesign => "Architecture Design",
            Self::DatabaseSchemaDesign => "Database Schema Design",
            Self::ApiDesign => "API Design",
            Self::CodeGeneration => "Code Generation",
            Self::Validation => "Validation",
            Self::AutoFix => "Auto-fix",
            Self::AgentTeamVerification => "Agent-Team Verification",
        }
    }

    /// Whether the phase writes into the project directory.
    pub fn produces_files(&self) -> bool {
        matches!(self, Self::CodeGeneration | Self::AutoFix)
    }

    /// Whether the phase must return a structured document.
    pub fn requires_document(&self) -> bool {
        matches!(
            self,
            Self::RequirementsAnalysis
                | Self::ArchitectureDesign
                | Self::DatabaseSchemaDesign
                | Self::ApiDesign
        )
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Ordered phases of one run, split into done and still to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    completed: Vec<PhaseKind>,
    remaining: Vec<PhaseKind>,
}

impl PhasePlan {
    /// Plan for a fresh run starting at requirements analysis.
    pub fn full() -> Self {
        Self::from_phases(&PhaseKind::PIPELINE)
    }

    /// Plan for an iteration that re-enters at code generation.
    pub fn incremental() -> Self {
        Self::from_phases(&PhaseKind::INCREMENTAL)
    }

    fn from_phases(phases: &[PhaseKind]) -> Self {
        Self {
            completed: Vec::new(),
            remaining: phases.to_vec(),
        }
    }

    pub fn next(&self) -> Option<PhaseKind> {
        self.remaining.first().copied()
    }

    pub fn completed(&self) -> &[PhaseKind] {
        &self.completed
    }

    pub fn remaining(&self) -> &[PhaseKind] {
        &self.remaining
    }

    /// 1-based position of the next phase and the current plan length.
    pub fn position(&self) -> (usize, usize) {
        (self.completed.len() + 1, self.total())
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.remaining.len()
    }

    pub fn is_finished(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Move a phase from remaining to completed.
    pub fn mark_completed(&mut self, phase: PhaseKind) {
        if let Some(index) = self.remaining.iter().position(|p| *p == phase) {
            self.remaining.remove(index);
            self.completed.push(phase);
        }
    }

    /// Drop conditional phases that turned out not to apply.
    ///
    /// Only phases still pending are affected.
    pub fn narrow(&mut self, data_layer: bool, service_layer: bool) {
        self.remaining.retain(|phase| match phase {
            PhaseKind::DatabaseSchemaDesign => data_layer,
            PhaseKind::ApiDesign => service_layer,
            _ => true,
        });
    }

    /// Completed share of the plan in percent.
    pub fn percent(&self) -> u8 {
        let total = self.total();
        if total == 0 {
            return 100;
        }
        ((self.completed.len() * 100) / total) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_plan_order() {
        let plan = PhasePlan::full();
        assert_eq!(plan.next(), Some(PhaseKind::RequirementsAnalysis));
        assert_eq!(plan.total(), 7);
        assert_eq!(plan.percent(), 0);
        assert!(!plan.remaining().contains(&PhaseKind::AgentTeamVerification));
    }

    #[test]
    fn test_incremental_plan_starts_at_code_generation() {
        let plan = PhasePlan::incremental();
        assert_eq!(plan.next(), Some(PhaseKind::CodeGeneration));
        assert_eq!(plan.total(), 3);
    }

    #[test]
    fn test_percent_never_decreases_when_narrowing() {
        let mut plan = PhasePlan::full();
        let mut last = plan.percent();

        plan.mark_completed(PhaseKind::RequirementsAnalysis);
        assert!(plan.percent() >= last);
        last = plan.percent();

        plan.narrow(false, false);
        assert!(plan.percent() >= last);
        assert_eq!(plan.total(), 5);

        while let Some(phase) = plan.next() {
            last = plan.percent();
            plan.mark_completed(phase);
            assert!(plan.percent() > last);
        }
        assert_eq!(plan.percent(), 100);
    }

    #[test]
    fn test_narrow_keeps_completed_phases() {
        let mut plan = PhasePlan::full();
        for phase in [
            PhaseKind::RequirementsAnalysis,
            PhaseKind::ArchitectureDesign,
            PhaseKind::DatabaseSchemaDesign,
        ] {
            plan.mark_completed(phase);
        }
        plan.narrow(false, false);
        assert!(plan.completed().contains(&PhaseKind::DatabaseSchemaDesign));
        assert!(!plan.remaining().contains(&PhaseKind::ApiDesign));
    }

    #[test]
    fn test_labels() {
        assert_eq!(PhaseKind::AutoFix.to_string(), "Auto-fix");
        assert_eq!(PhaseKind::ApiDesign.as_str(), "api_design");
    }
}
