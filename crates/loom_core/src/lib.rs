//! # loom_core
//!
//! Generation pipeline engine for AppLoom.
//!
//! Turns a natural-language application description into a project directory
//! by running ordered phases against a code-generation collaborator.
//!
//! # Architecture
//!
//! - **Orchestrator**: Runs phases in the background, retrying transient upstream failures
//! - **Progress Store**: Shared per-session progress polled by clients
//! - **Phases**: Ordered pipeline steps, two of them conditional
//! - **Iteration**: Re-enters the pipeline with user feedback
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use loom_core::{GenerationOptions, Orchestrator, PipelineConfig};
//!
//! let orchestrator = Orchestrator::new(Arc::new(my_service), PipelineConfig::default());
//! let id = orchestrator.submit("a to-do list with local storage", GenerationOptions::static_site())?;
//!
//! // Poll until the session is finished
//! let status = orchestrator.status(&id)?;
//! println!("{}% - {}", status.progress, status.current_step);
//! ```

pub mod config;
pub mod error;
pub mod files;
pub mod generation;
pub mod iteration;
pub mod mock;
pub mod orchestrator;
pub mod phase;
pub mod progress;
pub mod session;
pub mod validate;

// Re-export main types for convenience
pub use config::PipelineConfig;
pub use error::{CoreError, CoreResult, UpstreamError};
pub use files::{parse_file_blocks, FileBatch, INCOMPLETE_MARKER, VERIFICATION_COMPLETE};
pub use generation::{
    CodeGenerationService, FilePreview, GeneratedFile, GenerationMode, PhaseArtifact,
    PhaseRequest,
};
pub use iteration::{IterationController, IterationOptions};
pub use mock::{CapturedRequest, MockGenerator};
pub use orchestrator::Orchestrator;
pub use phase::{PhaseKind, PhasePlan};
pub use progress::{ProgressRecord, ProgressStore};
pub use session::{
    FeedbackEntry, GenerationOptions, GenerationSession, SessionContext, SessionStatus,
};
pub use validate::{IssueKind, ProjectValidator, ValidationIssue, ValidationReport};
