//! Child processes run through the shell, one process group each.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::logs::{LogEntry, LogLevel, LogOrigin, SharedLogs};

/// How long to wait for output readers to drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit details of a finished child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

/// One line of child output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub text: String,
    pub from_stderr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Needed SIGKILL
    Killed,
    /// Had already exited
    AlreadyExited,
    /// Another caller is already terminating it
    InProgress,
}

/// Handle to a running child. The child itself is owned by a monitor task.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    command: String,
    terminating: AtomicBool,
    exit: watch::Receiver<Option<ExitInfo>>,
}

/// A freshly spawned process and the stream of its output lines.
pub struct SpawnedProcess {
    pub handle: Arc<ProcessHandle>,
    pub lines: mpsc::UnboundedReceiver<OutputLine>,
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Run `command` through the shell in `dir`.
///
/// Every output line is appended to `logs` and forwarded on the returned
/// channel for as long as the receiver is alive.
pub fn spawn_shell(
    command: &str,
    dir: &Path,
    origin: LogOrigin,
    logs: SharedLogs,
) -> RunnerResult<SpawnedProcess> {
    let mut cmd = shell_command(command);
    cmd.current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("PYTHONUNBUFFERED", "1")
        .env("BROWSER", "none")
        .env("CI", "true")
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| RunnerError::SpawnFailed(format!("`{}`: {}", command, e)))?;
    let pid = child
        .id()
        .ok_or_else(|| RunnerError::SpawnFailed(format!("`{}` exited immediately", command)))?;
    debug!("Spawned `{}` with pid {} in {}", command, pid, dir.display());

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(
            stdout,
            false,
            origin,
            logs.clone(),
            line_tx.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(
            stderr,
            true,
            origin,
            logs.clone(),
            line_tx,
        )));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let label = command.to_string();
    tokio::spawn(async move {
        let info = match child.wait().await {
            Ok(status) => ExitInfo {
                code: status.code(),
                success: status.success(),
            },
            Err(e) => {
                warn!("Failed to wait for `{}`: {}", label, e);
                ExitInfo {
                    code: None,
                    success: false,
                }
            }
        };
        for reader in readers {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
        }
        debug!("`{}` exited with {:?}", label, info.code);
        let _ = exit_tx.send(Some(info));
    });

    Ok(SpawnedProcess {
        handle: Arc::new(ProcessHandle {
            pid,
            command: command.to_string(),
            terminating: AtomicBool::new(false),
            exit: exit_rx,
        }),
        lines: line_rx,
    })
}

async fn forward_lines<R>(
    stream: R,
    from_stderr: bool,
    origin: LogOrigin,
    logs: SharedLogs,
    tx: mpsc::UnboundedSender<OutputLine>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let text = line.trim_end().to_string();
        if text.is_empty() {
            continue;
        }
        let level = LogLevel::classify(&text, from_stderr);
        logs.lock().push(LogEntry::new(origin, level, text.clone()));
        let _ = tx.send(OutputLine { text, from_stderr });
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_info().is_none()
    }

    /// Whether termination was requested through [`Self::terminate`].
    pub fn was_terminated(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Wait until the child has exited and its output has been drained.
    pub async fn wait(&self) -> ExitInfo {
        let unknown = ExitInfo {
            code: None,
            success: false,
        };
        let mut rx = self.exit.clone();
        let info = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).unwrap_or(unknown),
            Err(_) => unknown,
        };
        info
    }

    /// SIGTERM the process group, then SIGKILL it if it outlives `grace`.
    ///
    /// Only the first call signals; later calls return `InProgress`.
    pub async fn terminate(&self, grace: Duration) -> TerminateOutcome {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return TerminateOutcome::InProgress;
        }
        if !self.is_running() {
            return TerminateOutcome::AlreadyExited;
        }

        if let Err(e) = signal_group(self.pid, Signal::Terminate) {
            debug!("SIGTERM to group {} failed: {}", self.pid, e);
        }
        if tokio::time::timeout(grace, self.wait()).await.is_ok() {
            return TerminateOutcome::Graceful;
        }

        warn!(
            "`{}` (pid {}) ignored SIGTERM for {:?}, killing",
            self.command, self.pid, grace
        );
        if let Err(e) = signal_group(self.pid, Signal::Kill) {
            debug!("SIGKILL to group {} failed: {}", self.pid, e);
        }
        let _ = tokio::time::timeout(grace.max(DRAIN_TIMEOUT), self.wait()).await;
        TerminateOutcome::Killed
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> std::io::Result<()> {
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child was spawned as the leader of its own group, so pgid == pid.
    let result = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: Signal) -> std::io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogRing;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_output_reaches_log_and_channel() {
        let dir = TempDir::new().unwrap();
        let logs = LogRing::shared(50);
        let mut spawned = spawn_shell(
            "echo hello; echo oops >&2",
            dir.path(),
            LogOrigin::Run,
            logs.clone(),
        )
        .unwrap();

        let exit = spawned.handle.wait().await;
        assert!(exit.success);

        let mut received = Vec::new();
        while let Ok(line) = spawned.lines.try_recv() {
            received.push(line);
        }
        assert_eq!(received.len(), 2);
        assert!(received.iter().any(|l| l.text == "oops" && l.from_stderr));

        let entries = logs.lock().lines();
        assert!(entries
            .iter()
            .any(|e| e.message == "oops" && e.level == LogLevel::Error));
    }

    #[tokio::test]
    async fn test_terminate_kills_whole_group() {
        let dir = TempDir::new().unwrap();
        let spawned = spawn_shell(
            "sleep 30 & sleep 30",
            dir.path(),
            LogOrigin::Run,
            LogRing::shared(10),
        )
        .unwrap();
        let handle = spawned.handle;
        assert!(handle.is_running());

        let outcome = handle.terminate(Duration::from_secs(2)).await;
        assert_eq!(outcome, TerminateOutcome::Graceful);
        assert!(!handle.is_running());
        assert!(handle.was_terminated());

        assert_eq!(
            handle.terminate(Duration::from_secs(2)).await,
            TerminateOutcome::InProgress
        );
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let spawned = spawn_shell(
            "trap '' TERM; echo ready; while true; do sleep 0.1; done",
            dir.path(),
            LogOrigin::Run,
            LogRing::shared(10),
        )
        .unwrap();
        let mut lines = spawned.lines;
        lines.recv().await.unwrap();

        let outcome = spawned
            .handle
            .terminate(Duration::from_millis(300))
            .await;
        assert_eq!(outcome, TerminateOutcome::Killed);
        assert!(!spawned.handle.is_running());
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let dir = TempDir::new().unwrap();
        let spawned =
            spawn_shell("exit 7", dir.path(), LogOrigin::Run, LogRing::shared(10)).unwrap();
        let exit = spawned.handle.wait().await;
        assert_eq!(exit.code, Some(7));
        assert!(!exit.success);
        assert_eq!(
            spawned.handle.terminate(Duration::from_secs(1)).await,
            TerminateOutcome::AlreadyExited
        );
    }
}
