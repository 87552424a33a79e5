//! # loom_runner
//!
//! Local preview supervisor for AppLoom.
//!
//! Detects what kind of project a generated directory holds, installs its
//! dependencies, runs it as a child process group and watches its output for
//! the URL it serves on.
//!
//! # Example
//!
//! ```rust,ignore
//! use loom_runner::{PreviewSupervisor, SupervisorConfig};
//!
//! let supervisor = PreviewSupervisor::new(SupervisorConfig::default());
//! let preview = supervisor.start("session-1", project_dir, None).await?;
//! println!("{:?}", preview.url);
//! supervisor.stop("session-1").await?;
//! ```

pub mod config;
pub mod detect;
pub mod error;
pub mod fix;
pub mod logs;
pub mod mock;
pub mod process;
pub mod supervisor;
pub mod url;

pub use config::SupervisorConfig;
pub use detect::{
    find_free_port, FileSystemDetector, InstallCheck, LaunchPlan, ProjectType,
    ProjectTypeDetector,
};
pub use error::{RunnerError, RunnerResult};
pub use fix::{FailureContext, FailureFixer, FilePatch};
pub use logs::{AiPatch, LogEntry, LogLevel, LogOrigin, LogRing};
pub use mock::{FixedPlanDetector, RecordingFixer};
pub use supervisor::{PreviewSnapshot, PreviewStatus, PreviewSupervisor, StopOutcome};
pub use url::{UrlDetector, UrlMatcher};
