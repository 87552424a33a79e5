//! Integration tests for the preview supervisor.
//!
//! These run small shell scripts in place of real dev servers, so they only
//! need `sh`, `sleep` and `echo`.

use std::sync::Arc;
use std::time::Duration;

use loom_runner::{
    FilePatch, FixedPlanDetector, InstallCheck, LaunchPlan, LogOrigin, PreviewStatus,
    PreviewSupervisor, ProjectType, RecordingFixer, RunnerError, StopOutcome, SupervisorConfig,
};
use tempfile::TempDir;

fn config() -> SupervisorConfig {
    SupervisorConfig::default()
        .with_detection_window(Duration::from_secs(5))
        .with_grace_period(Duration::from_secs(1))
}

fn supervisor(command: &str) -> PreviewSupervisor {
    PreviewSupervisor::new(config()).with_detector(Arc::new(FixedPlanDetector::command(command)))
}

async fn wait_for_status(
    supervisor: &PreviewSupervisor,
    id: &str,
    expected: PreviewStatus,
) -> bool {
    for _ in 0..50 {
        if supervisor.status(id).map(|s| s.status).ok() == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// A dev server banner resolves start with the announced URL.
#[tokio::test]
async fn test_start_detects_url() {
    let supervisor = supervisor("echo 'VITE ready'; echo '  Local:   http://localhost:5173/'; sleep 30");
    let dir = TempDir::new().unwrap();

    let preview = supervisor.start("s1", dir.path(), None).await.unwrap();
    assert_eq!(preview.status, PreviewStatus::Running);
    assert_eq!(preview.url.as_deref(), Some("http://localhost:5173"));
    assert!(preview.pid.is_some());
    assert!(preview.fallback_url.is_none());
    assert!(preview
        .logs
        .iter()
        .any(|l| l.origin == LogOrigin::Run && l.message == "VITE ready"));

    assert_eq!(supervisor.stop("s1").await.unwrap(), StopOutcome::Stopped);
    let stopped = supervisor.status("s1").unwrap();
    assert_eq!(stopped.status, PreviewStatus::Stopped);
    assert!(stopped.pid.is_none());
    assert!(stopped.url.is_none());
}

/// A second start while running is rejected and leaves the first process alone.
#[tokio::test]
async fn test_double_start_rejected() {
    let supervisor = supervisor("echo 'listening on port 4100'; sleep 30");
    let dir = TempDir::new().unwrap();

    let first = supervisor.start("s1", dir.path(), None).await.unwrap();
    let err = supervisor.start("s1", dir.path(), None).await.unwrap_err();
    assert!(matches!(err, RunnerError::AlreadyRunning(_)));

    let status = supervisor.status("s1").unwrap();
    assert_eq!(status.status, PreviewStatus::Running);
    assert_eq!(status.pid, first.pid);

    supervisor.shutdown_all().await;
}

/// Stopping twice, or stopping an unknown id, is a no-op.
#[tokio::test]
async fn test_stop_is_idempotent() {
    let supervisor = supervisor("echo 'http://localhost:4200'; sleep 30");
    let dir = TempDir::new().unwrap();

    assert_eq!(supervisor.stop("nobody").await.unwrap(), StopOutcome::NotRunning);

    supervisor.start("s1", dir.path(), None).await.unwrap();
    assert_eq!(supervisor.stop("s1").await.unwrap(), StopOutcome::Stopped);
    assert_eq!(supervisor.stop("s1").await.unwrap(), StopOutcome::NotRunning);
    assert_eq!(supervisor.status("s1").unwrap().status, PreviewStatus::Stopped);
}

/// Without a URL the preview still runs, with a fallback guess.
#[tokio::test]
async fn test_silent_process_uses_fallback_url() {
    let supervisor = PreviewSupervisor::new(
        config().with_detection_window(Duration::from_millis(300)),
    )
    .with_detector(Arc::new(FixedPlanDetector::new(LaunchPlan::new(
        ProjectType::Express,
        "echo 'compiling'; sleep 30",
        3000,
    ))));
    let dir = TempDir::new().unwrap();

    let preview = supervisor.start("s1", dir.path(), None).await.unwrap();
    assert_eq!(preview.status, PreviewStatus::Running);
    assert!(preview.url.is_none());
    assert_eq!(preview.fallback_url.as_deref(), Some("http://localhost:3000"));
    assert_eq!(preview.project_type, Some(ProjectType::Express));

    supervisor.shutdown_all().await;
}

/// A crash after startup flips the session to failed and keeps the output.
#[tokio::test]
async fn test_crash_after_start_marks_failed() {
    let supervisor = supervisor(
        "echo 'listening on port 4321'; sleep 0.3; echo 'fatal: boom' >&2; exit 3",
    );
    let dir = TempDir::new().unwrap();

    let preview = supervisor.start("s1", dir.path(), None).await.unwrap();
    assert_eq!(preview.url.as_deref(), Some("http://localhost:4321"));

    assert!(wait_for_status(&supervisor, "s1", PreviewStatus::Failed).await);
    let failed = supervisor.status("s1").unwrap();
    assert!(failed.error.unwrap().contains("code 3"));
    assert!(failed.logs.iter().any(|l| l.message == "fatal: boom"));
    assert!(failed.pid.is_none());

    // A failed preview can be started again.
    let again = supervisor.start("s1", dir.path(), None).await.unwrap();
    assert_eq!(again.status, PreviewStatus::Running);
    supervisor.shutdown_all().await;
}

/// Dying before any URL shows up fails the start call itself.
#[tokio::test]
async fn test_exit_during_startup() {
    let supervisor = supervisor("echo 'SyntaxError: unexpected token' >&2; exit 1");
    let dir = TempDir::new().unwrap();

    let err = supervisor.start("s1", dir.path(), None).await.unwrap_err();
    assert!(matches!(err, RunnerError::ExitedEarly { code: Some(1) }));

    let status = supervisor.status("s1").unwrap();
    assert_eq!(status.status, PreviewStatus::Failed);
    assert!(status
        .logs
        .iter()
        .any(|l| l.message.contains("SyntaxError")));
}

/// Install runs once; the check path skips it on later starts.
#[tokio::test]
async fn test_install_runs_until_marker_exists() {
    let plan = LaunchPlan::new(
        ProjectType::Node,
        "echo 'Server running at http://localhost:4300'; sleep 30",
        3000,
    )
    .with_install(
        "echo 'added 12 packages'; mkdir -p node_modules",
        InstallCheck::Path("node_modules".into()),
    );
    let supervisor =
        PreviewSupervisor::new(config()).with_detector(Arc::new(FixedPlanDetector::new(plan)));
    let dir = TempDir::new().unwrap();

    let first = supervisor.start("s1", dir.path(), None).await.unwrap();
    assert!(first
        .logs
        .iter()
        .any(|l| l.origin == LogOrigin::Install && l.message == "added 12 packages"));
    assert!(dir.path().join("node_modules").is_dir());

    let second = supervisor.restart("s1", None).await.unwrap();
    assert_eq!(second.status, PreviewStatus::Running);
    assert!(!second.logs.iter().any(|l| l.origin == LogOrigin::Install));

    supervisor.shutdown_all().await;
}

/// A failing install never launches the app and keeps its output.
#[tokio::test]
async fn test_install_failure() {
    let plan = LaunchPlan::new(ProjectType::Node, "echo should-not-run; sleep 30", 3000)
        .with_install(
            "echo 'npm ERR! 404 Not Found' >&2; exit 2",
            InstallCheck::Path("node_modules".into()),
        );
    let supervisor =
        PreviewSupervisor::new(config()).with_detector(Arc::new(FixedPlanDetector::new(plan)));
    let dir = TempDir::new().unwrap();

    let err = supervisor.start("s1", dir.path(), None).await.unwrap_err();
    assert!(matches!(err, RunnerError::InstallFailed(_)));

    let status = supervisor.status("s1").unwrap();
    assert_eq!(status.status, PreviewStatus::Failed);
    assert!(status.logs.iter().any(|l| l.message.contains("404")));
    assert!(!status.logs.iter().any(|l| l.message == "should-not-run"));
}

/// Patch markers printed by the process are reported separately.
#[tokio::test]
async fn test_patch_markers_are_surfaced() {
    let supervisor = supervisor(
        "echo \"AI_PATCH_APPLIED: File 'src/app.js' patched by AI.\"; \
         echo 'Running on http://127.0.0.1:8000'; sleep 30",
    );
    let dir = TempDir::new().unwrap();

    let preview = supervisor.start("s1", dir.path(), None).await.unwrap();
    assert_eq!(preview.url.as_deref(), Some("http://127.0.0.1:8000"));
    assert_eq!(preview.patches.len(), 1);
    assert_eq!(preview.patches[0].file, "src/app.js");
    assert!(!preview
        .logs
        .iter()
        .any(|l| l.message.contains("AI_PATCH_APPLIED")));

    supervisor.shutdown_all().await;
}

/// The fixer sees the crash output and its patch is applied before retrying.
#[tokio::test]
async fn test_startup_crash_is_fixed() {
    let fixer = RecordingFixer::new().with_patch(FilePatch::new("config.js", "module.exports = {};\n"));
    let supervisor = supervisor(
        "test -f config.js || { echo 'Cannot find module ./config.js' >&2; exit 1; }; \
         echo 'http://localhost:4400'; sleep 30",
    )
    .with_fixer(Arc::new(fixer.clone()));
    let dir = TempDir::new().unwrap();

    let preview = supervisor
        .start("s1", dir.path(), Some("openai/gpt-4o"))
        .await
        .unwrap();
    assert_eq!(preview.status, PreviewStatus::Running);
    assert_eq!(preview.patches[0].file, "config.js");
    assert!(dir.path().join("config.js").exists());

    let failures = fixer.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0]
        .recent_logs
        .iter()
        .any(|l| l.contains("Cannot find module")));

    supervisor.shutdown_all().await;
}

/// Node stack traces carry `file:line` pairs that must not pass for a URL.
#[tokio::test]
async fn test_node_crash_reaches_fixer() {
    let fixer = RecordingFixer::new().with_patch(FilePatch::new("config.js", "module.exports = {};\n"));
    let supervisor = supervisor(
        "test -f config.js || { \
           echo 'node:internal/modules/cjs/loader:1080' >&2; \
           echo \"Error: Cannot find module './config'\" >&2; \
           echo '    at Object.<anonymous> (/app/server.js:1045:12)' >&2; \
           exit 1; }; \
         echo 'Server listening on port 4410'; sleep 30",
    )
    .with_fixer(Arc::new(fixer.clone()));
    let dir = TempDir::new().unwrap();

    let preview = supervisor
        .start("s1", dir.path(), Some("openai/gpt-4o"))
        .await
        .unwrap();
    assert_eq!(preview.status, PreviewStatus::Running);
    assert_eq!(preview.url.as_deref(), Some("http://localhost:4410"));
    assert_eq!(fixer.failures().len(), 1);
    assert_eq!(fixer.failures()[0].exit_code, Some(1));

    supervisor.shutdown_all().await;
}

/// Fix attempts are bounded.
#[tokio::test]
async fn test_fix_attempts_are_bounded() {
    let fixer = RecordingFixer::new().with_patch(FilePatch::new("noop.txt", "x"));
    let supervisor = supervisor("echo 'still broken' >&2; exit 1").with_fixer(Arc::new(fixer.clone()));
    let dir = TempDir::new().unwrap();

    let err = supervisor
        .start("s1", dir.path(), Some("openai/gpt-4o"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::ExitedEarly { .. }));
    assert_eq!(fixer.failures().len(), 1);
}

/// Restart yields a new process for the same session.
#[tokio::test]
async fn test_restart_replaces_process() {
    let supervisor = supervisor("echo 'http://localhost:4500'; sleep 30");
    let dir = TempDir::new().unwrap();

    let first = supervisor.start("s1", dir.path(), None).await.unwrap();
    let second = supervisor.restart("s1", None).await.unwrap();
    assert_eq!(second.status, PreviewStatus::Running);
    assert_ne!(first.pid, second.pid);

    let err = supervisor.restart("unknown", None).await.unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(_)));

    supervisor.shutdown_all().await;
}

/// Unload notifications stop the preview in the background.
#[tokio::test]
async fn test_notify_unload_stops_preview() {
    let supervisor = supervisor("echo 'http://localhost:4600'; sleep 30");
    let dir = TempDir::new().unwrap();

    supervisor.start("s1", dir.path(), None).await.unwrap();
    supervisor.notify_unload("s1");
    supervisor.notify_unload("never-started");

    assert!(wait_for_status(&supervisor, "s1", PreviewStatus::Stopped).await);
}

/// Idle previews are reaped; touched ones survive.
#[tokio::test]
async fn test_idle_previews_are_stopped() {
    let supervisor = supervisor("echo 'http://localhost:4700'; sleep 30");
    let idle_dir = TempDir::new().unwrap();
    let busy_dir = TempDir::new().unwrap();

    supervisor.start("idle", idle_dir.path(), None).await.unwrap();
    supervisor.start("busy", busy_dir.path(), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    supervisor.status("busy").unwrap();

    let reaped = supervisor.stop_idle(Duration::from_millis(300)).await;
    assert_eq!(reaped, vec!["idle".to_string()]);
    assert_eq!(supervisor.status("idle").unwrap().status, PreviewStatus::Stopped);
    assert_eq!(supervisor.status("busy").unwrap().status, PreviewStatus::Running);

    assert_eq!(supervisor.shutdown_all().await, 1);
}

#[tokio::test]
async fn test_status_of_unknown_session() {
    let supervisor = supervisor("sleep 30");
    let err = supervisor.status("missing").unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(_)));
}

#[tokio::test]
async fn test_missing_project_directory() {
    let supervisor = supervisor("sleep 30");
    let err = supervisor
        .start("s1", std::path::Path::new("/no/such/project"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::ProjectNotFound(_)));
    assert_eq!(supervisor.status("s1").unwrap().status, PreviewStatus::Failed);
}
