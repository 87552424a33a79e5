//! Preview supervisor: one live process per session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::detect::{FileSystemDetector, InstallCheck, LaunchPlan, ProjectType, ProjectTypeDetector};
use crate::error::{RunnerError, RunnerResult};
use crate::fix::{apply_patch, FailureContext, FailureFixer};
use crate::logs::{patch_marker_line, AiPatch, LogEntry, LogLevel, LogOrigin, LogRing, SharedLogs};
use crate::process::{spawn_shell, ExitInfo, ProcessHandle, SpawnedProcess, TerminateOutcome};
use crate::url::UrlDetector;

/// Log lines handed to the fixer after a crash.
const FIX_CONTEXT_LINES: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl std::fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PreviewStatus::Stopped => "stopped",
            PreviewStatus::Starting => "starting",
            PreviewStatus::Running => "running",
            PreviewStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    /// Nothing was running; no state changed
    NotRunning,
}

/// Point-in-time view of a preview session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewSnapshot {
    pub session_id: String,
    pub status: PreviewStatus,
    pub url: Option<String>,
    /// Best guess when no URL was announced
    pub fallback_url: Option<String>,
    pub project_type: Option<ProjectType>,
    pub pid: Option<u32>,
    pub logs: Vec<LogEntry>,
    pub patches: Vec<AiPatch>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

struct PreviewSession {
    project_dir: PathBuf,
    status: PreviewStatus,
    url: Option<String>,
    fallback_url: Option<String>,
    project_type: Option<ProjectType>,
    error: Option<String>,
    logs: SharedLogs,
    process: Option<Arc<ProcessHandle>>,
    /// Bumped by every start and stop; stale launches and monitors compare against it
    generation: u64,
    last_touched: Instant,
    started_at: Option<DateTime<Utc>>,
}

impl PreviewSession {
    fn new(project_dir: &Path, log_capacity: usize) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            status: PreviewStatus::Stopped,
            url: None,
            fallback_url: None,
            project_type: None,
            error: None,
            logs: LogRing::shared(log_capacity),
            process: None,
            generation: 0,
            last_touched: Instant::now(),
            started_at: None,
        }
    }

    fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    fn live_process(&self) -> Option<Arc<ProcessHandle>> {
        self.process.clone().filter(|p| p.is_running())
    }

    fn owns(&self, handle: &Arc<ProcessHandle>) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, handle))
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs.lock().record(LogOrigin::Supervisor, level, message);
    }

    fn snapshot(&self, session_id: &str) -> PreviewSnapshot {
        let logs = self.logs.lock();
        PreviewSnapshot {
            session_id: session_id.to_string(),
            status: self.status,
            url: self.url.clone(),
            fallback_url: self.fallback_url.clone(),
            project_type: self.project_type,
            pid: self.live_process().map(|p| p.pid()),
            logs: logs.lines(),
            patches: logs.patches(),
            error: self.error.clone(),
            started_at: self.started_at,
        }
    }
}

enum Startup {
    Ready(String),
    Silent,
    Exited(ExitInfo),
}

/// Runs generated projects as local previews.
///
/// Starting a session that is already starting or running is rejected, so a
/// session never owns more than one live process.
#[derive(Clone)]
pub struct PreviewSupervisor {
    sessions: Arc<Mutex<HashMap<String, PreviewSession>>>,
    detector: Arc<dyn ProjectTypeDetector>,
    urls: Arc<UrlDetector>,
    fixer: Option<Arc<dyn FailureFixer>>,
    config: Arc<SupervisorConfig>,
}

impl PreviewSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let detector =
            FileSystemDetector::new(config.port_range_start, config.port_search_attempts);
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            detector: Arc::new(detector),
            urls: Arc::new(UrlDetector::default()),
            fixer: None,
            config: Arc::new(config),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn ProjectTypeDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_url_detector(mut self, urls: UrlDetector) -> Self {
        self.urls = Arc::new(urls);
        self
    }

    /// Enable automatic fixes for previews that crash during startup.
    pub fn with_fixer(mut self, fixer: Arc<dyn FailureFixer>) -> Self {
        self.fixer = Some(fixer);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch the project in `project_dir` as the preview for `session_id`.
    ///
    /// Resolves once a URL is detected, the detection window elapses or the
    /// process dies. `model` is only used for automatic fixes.
    pub async fn start(
        &self,
        session_id: &str,
        project_dir: &Path,
        model: Option<&str>,
    ) -> RunnerResult<PreviewSnapshot> {
        let (generation, logs) = self.claim(session_id, project_dir)?;
        info!(
            "Starting preview {} from {}",
            session_id,
            project_dir.display()
        );

        if let Err(e) = self
            .launch(session_id, generation, project_dir, &logs, model)
            .await
        {
            warn!("Preview {} failed to start: {}", session_id, e);
            self.mark_failed(session_id, generation, &e.to_string());
            return Err(e);
        }
        self.snapshot(session_id)
    }

    /// Stop the preview's process group. A session with nothing running is left as is.
    pub async fn stop(&self, session_id: &str) -> RunnerResult<StopOutcome> {
        let (handle, logs) = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(session_id) else {
                return Ok(StopOutcome::NotRunning);
            };
            session.touch();
            let live = session.live_process();
            if live.is_none() && session.status != PreviewStatus::Starting {
                return Ok(StopOutcome::NotRunning);
            }
            session.generation += 1;
            session.status = PreviewStatus::Stopped;
            session.url = None;
            session.fallback_url = None;
            session.error = None;
            (live, session.logs.clone())
        };

        let Some(handle) = handle else {
            logs.lock()
                .record(LogOrigin::Supervisor, LogLevel::Info, "Preview start cancelled");
            return Ok(StopOutcome::Stopped);
        };

        info!("Stopping preview {} (pid {})", session_id, handle.pid());
        let grace = self.config.grace_period();
        let message = match handle.terminate(grace).await {
            TerminateOutcome::Graceful | TerminateOutcome::AlreadyExited => "Process stopped",
            TerminateOutcome::Killed => "Process killed after grace period",
            TerminateOutcome::InProgress => {
                let _ = tokio::time::timeout(grace * 2, handle.wait()).await;
                "Process stopped"
            }
        };
        logs.lock()
            .record(LogOrigin::Supervisor, LogLevel::Info, message);

        if let Some(session) = self.sessions.lock().get_mut(session_id) {
            if session.owns(&handle) {
                session.process = None;
            }
        }
        Ok(StopOutcome::Stopped)
    }

    /// Stop, then start again from the same directory.
    pub async fn restart(
        &self,
        session_id: &str,
        model: Option<&str>,
    ) -> RunnerResult<PreviewSnapshot> {
        let project_dir = self
            .sessions
            .lock()
            .get(session_id)
            .map(|s| s.project_dir.clone())
            .ok_or_else(|| RunnerError::NotFound(session_id.to_string()))?;
        self.stop(session_id).await?;
        self.start(session_id, &project_dir, model).await
    }

    /// Current state of a preview. Counts as activity for the idle reaper.
    pub fn status(&self, session_id: &str) -> RunnerResult<PreviewSnapshot> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RunnerError::NotFound(session_id.to_string()))?;
        session.touch();
        Ok(session.snapshot(session_id))
    }

    /// The client went away; stop in the background.
    pub fn notify_unload(&self, session_id: &str) {
        let this = self.clone();
        let id = session_id.to_string();
        tokio::spawn(async move {
            match this.stop(&id).await {
                Ok(StopOutcome::Stopped) => info!("Stopped preview {} after client unload", id),
                Ok(StopOutcome::NotRunning) => debug!("Unload for idle preview {}", id),
                Err(e) => warn!("Failed to stop preview {} on unload: {}", id, e),
            }
        });
    }

    /// Stop every preview. Returns how many were running.
    pub async fn shutdown_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        let mut stopped = 0;
        for id in ids {
            if let Ok(StopOutcome::Stopped) = self.stop(&id).await {
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!("Stopped {} preview(s)", stopped);
        }
        stopped
    }

    /// Stop previews nobody has touched for `limit`. Returns their ids.
    pub async fn stop_idle(&self, limit: Duration) -> Vec<String> {
        let idle: Vec<String> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.live_process().is_some() && s.last_touched.elapsed() >= limit)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &idle {
            info!("Stopping idle preview {}", id);
            if let Err(e) = self.stop(id).await {
                warn!("Failed to stop idle preview {}: {}", id, e);
            }
        }
        idle
    }

    /// Periodically stop idle previews. `None` when idle reaping is disabled.
    pub fn spawn_idle_reaper(&self) -> Option<JoinHandle<()>> {
        let limit = self.config.idle_timeout()?;
        let this = self.clone();
        let every = self.config.reaper_interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                this.stop_idle(limit).await;
            }
        }))
    }

    fn snapshot(&self, session_id: &str) -> RunnerResult<PreviewSnapshot> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.snapshot(session_id))
            .ok_or_else(|| RunnerError::NotFound(session_id.to_string()))
    }

    fn claim(&self, session_id: &str, project_dir: &Path) -> RunnerResult<(u64, SharedLogs)> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| PreviewSession::new(project_dir, self.config.log_capacity));

        let busy = matches!(
            session.status,
            PreviewStatus::Starting | PreviewStatus::Running
        );
        if busy || session.live_process().is_some() {
            return Err(RunnerError::AlreadyRunning(session_id.to_string()));
        }

        session.generation += 1;
        session.project_dir = project_dir.to_path_buf();
        session.status = PreviewStatus::Starting;
        session.url = None;
        session.fallback_url = None;
        session.project_type = None;
        session.error = None;
        session.process = None;
        session.started_at = Some(Utc::now());
        session.touch();
        session.logs.lock().clear();
        Ok((session.generation, session.logs.clone()))
    }

    fn is_current(&self, session_id: &str, generation: u64) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .is_some_and(|s| s.generation == generation)
    }

    fn with_current<F>(&self, session_id: &str, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut PreviewSession),
    {
        match self.sessions.lock().get_mut(session_id) {
            Some(session) if session.generation == generation => {
                f(session);
                true
            }
            _ => false,
        }
    }

    fn detach(&self, session_id: &str, handle: &Arc<ProcessHandle>) {
        if let Some(session) = self.sessions.lock().get_mut(session_id) {
            if session.owns(handle) {
                session.process = None;
            }
        }
    }

    fn mark_failed(&self, session_id: &str, generation: u64, message: &str) {
        self.with_current(session_id, generation, |s| {
            s.status = PreviewStatus::Failed;
            s.error = Some(message.to_string());
            s.url = None;
            s.process = None;
            s.log(LogLevel::Error, message);
        });
    }

    async fn launch(
        &self,
        session_id: &str,
        generation: u64,
        project_dir: &Path,
        logs: &SharedLogs,
        model: Option<&str>,
    ) -> RunnerResult<()> {
        if !project_dir.is_dir() {
            return Err(RunnerError::ProjectNotFound(
                project_dir.display().to_string(),
            ));
        }
        let plan = self.detector.detect(project_dir)?;
        self.with_current(session_id, generation, |s| {
            s.project_type = Some(plan.project_type);
        });
        logs.lock().record(
            LogOrigin::Supervisor,
            LogLevel::Info,
            format!(
                "Detected {} project, running `{}`",
                plan.project_type, plan.run_command
            ),
        );

        if plan.needs_install(project_dir) {
            self.install(session_id, generation, project_dir, &plan, logs)
                .await?;
            if !self.is_current(session_id, generation) {
                return Ok(());
            }
        }

        let mut fix_attempts = 0;
        loop {
            let spawned = spawn_shell(&plan.run_command, project_dir, LogOrigin::Run, logs.clone())?;
            let handle = spawned.handle.clone();
            if !self.with_current(session_id, generation, |s| s.process = Some(handle.clone())) {
                handle.terminate(self.config.grace_period()).await;
                return Ok(());
            }

            match self.watch_startup(spawned).await {
                Startup::Ready(url) => {
                    self.mark_running(session_id, generation, &handle, Some(url), None);
                    return Ok(());
                }
                Startup::Silent => {
                    logs.lock().record(
                        LogOrigin::Supervisor,
                        LogLevel::Warn,
                        format!(
                            "No URL detected within {:?}, assuming {}",
                            self.config.detection_window(),
                            plan.fallback_url()
                        ),
                    );
                    self.mark_running(
                        session_id,
                        generation,
                        &handle,
                        None,
                        Some(plan.fallback_url()),
                    );
                    return Ok(());
                }
                Startup::Exited(exit) => {
                    self.detach(session_id, &handle);
                    if !self.is_current(session_id, generation) {
                        return Ok(());
                    }
                    if let (Some(fixer), Some(model)) = (&self.fixer, model) {
                        if fix_attempts < self.config.max_fix_attempts {
                            fix_attempts += 1;
                            let failure = FailureContext {
                                project_dir: project_dir.to_path_buf(),
                                project_type: plan.project_type,
                                command: plan.run_command.clone(),
                                exit_code: exit.code,
                                recent_logs: logs.lock().tail(FIX_CONTEXT_LINES),
                                model: model.to_string(),
                            };
                            if self.try_fix(fixer.as_ref(), &failure, logs).await
                                && self.is_current(session_id, generation)
                            {
                                continue;
                            }
                        }
                    }
                    return Err(RunnerError::ExitedEarly { code: exit.code });
                }
            }
        }
    }

    async fn install(
        &self,
        session_id: &str,
        generation: u64,
        project_dir: &Path,
        plan: &LaunchPlan,
        logs: &SharedLogs,
    ) -> RunnerResult<()> {
        let Some(command) = plan.install_command.as_deref() else {
            return Ok(());
        };
        info!("Installing dependencies for {}: {}", session_id, command);
        logs.lock().record(
            LogOrigin::Supervisor,
            LogLevel::Info,
            format!("Installing dependencies: `{}`", command),
        );

        let spawned = spawn_shell(command, project_dir, LogOrigin::Install, logs.clone())?;
        let handle = spawned.handle;
        if !self.with_current(session_id, generation, |s| s.process = Some(handle.clone())) {
            handle.terminate(self.config.grace_period()).await;
            return Ok(());
        }

        let timeout = self.config.install_timeout();
        let exit = match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                handle.terminate(self.config.grace_period()).await;
                self.detach(session_id, &handle);
                return Err(RunnerError::InstallTimeout(timeout.as_secs()));
            }
        };
        self.detach(session_id, &handle);
        if !self.is_current(session_id, generation) {
            return Ok(());
        }
        if !exit.success {
            return Err(RunnerError::InstallFailed(format!(
                "`{}` exited with code {}",
                command,
                exit.code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )));
        }

        if let Some(InstallCheck::Stamp(stamp)) = &plan.install_check {
            std::fs::write(project_dir.join(stamp), Utc::now().to_rfc3339())?;
        }
        Ok(())
    }

    async fn watch_startup(&self, spawned: SpawnedProcess) -> Startup {
        let SpawnedProcess { handle, mut lines } = spawned;
        let deadline = tokio::time::sleep(self.config.detection_window());
        tokio::pin!(deadline);
        let exited = handle.wait();
        tokio::pin!(exited);

        let mut open = true;
        loop {
            tokio::select! {
                biased;
                line = lines.recv(), if open => match line {
                    Some(line) => {
                        if let Some(url) = self.urls.detect(&line.text) {
                            return Startup::Ready(url);
                        }
                    }
                    None => open = false,
                },
                exit = &mut exited => return Startup::Exited(exit),
                _ = &mut deadline => return Startup::Silent,
            }
        }
    }

    fn mark_running(
        &self,
        session_id: &str,
        generation: u64,
        handle: &Arc<ProcessHandle>,
        url: Option<String>,
        fallback_url: Option<String>,
    ) {
        let updated = self.with_current(session_id, generation, |s| {
            if let Some(url) = &url {
                s.log(LogLevel::Info, format!("Preview available at {}", url));
            }
            s.status = PreviewStatus::Running;
            s.url = url;
            s.fallback_url = fallback_url;
            s.touch();
        });
        if updated {
            info!("Preview {} running (pid {})", session_id, handle.pid());
            self.spawn_monitor(session_id.to_string(), generation, handle.clone());
        }
    }

    /// Mark the session failed if its process dies without being stopped.
    fn spawn_monitor(&self, session_id: String, generation: u64, handle: Arc<ProcessHandle>) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let exit = handle.wait().await;
            if handle.was_terminated() {
                return;
            }
            let mut sessions = sessions.lock();
            let Some(session) = sessions.get_mut(&session_id) else {
                return;
            };
            if session.generation != generation || !session.owns(&handle) {
                return;
            }
            let message = format!(
                "Process exited unexpectedly with code {}",
                exit.code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            warn!("Preview {}: {}", session_id, message);
            session.status = PreviewStatus::Failed;
            session.url = None;
            session.process = None;
            session.log(LogLevel::Error, &message);
            session.error = Some(message);
        });
    }

    async fn try_fix(
        &self,
        fixer: &dyn FailureFixer,
        failure: &FailureContext,
        logs: &SharedLogs,
    ) -> bool {
        logs.lock().record(
            LogOrigin::Supervisor,
            LogLevel::Warn,
            format!(
                "`{}` exited during startup, attempting an automatic fix",
                failure.command
            ),
        );

        let patches = match fixer.propose_fix(failure).await {
            Ok(patches) => patches,
            Err(e) => {
                warn!("Automatic fix failed: {}", e);
                logs.lock().record(
                    LogOrigin::Supervisor,
                    LogLevel::Error,
                    format!("Automatic fix failed: {}", e),
                );
                return false;
            }
        };

        let mut applied = 0;
        for patch in &patches {
            match apply_patch(&failure.project_dir, patch) {
                Ok(_) => {
                    info!("Patched {} in {}", patch.path, failure.project_dir.display());
                    logs.lock().record(
                        LogOrigin::Supervisor,
                        LogLevel::Info,
                        patch_marker_line(&patch.path, &patch.excerpt()),
                    );
                    applied += 1;
                }
                Err(e) => warn!("Skipping patch for {}: {}", patch.path, e),
            }
        }
        if applied == 0 {
            logs.lock()
                .record(LogOrigin::Supervisor, LogLevel::Warn, "No fix was applied");
        }
        applied > 0
    }
}
