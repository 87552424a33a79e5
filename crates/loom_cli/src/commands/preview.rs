//! Preview command - launch a project directory and keep it running.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use loom_runner::{PreviewSnapshot, PreviewStatus, PreviewSupervisor};
use tracing::warn;

use super::load_settings;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Args)]
pub struct PreviewArgs {
    /// Project directory to preview
    #[arg(default_value = ".")]
    dir: PathBuf,

    /// Model used to fix startup crashes (requires an API key)
    #[arg(short, long)]
    model: Option<String>,

    /// Session id (defaults to the directory name)
    #[arg(short, long)]
    session: Option<String>,
}

pub async fn execute(args: PreviewArgs) -> Result<()> {
    let settings = load_settings()?;
    let dir = args
        .dir
        .canonicalize()
        .with_context(|| format!("Project directory not found: {}", args.dir.display()))?;
    let id = args.session.unwrap_or_else(|| {
        dir.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "preview".to_string())
    });

    let mut supervisor = PreviewSupervisor::new(settings.supervisor.clone());
    if args.model.is_some() {
        match loom_llm::LlmClient::new(settings.llm.clone()) {
            Ok(client) => supervisor = supervisor.with_fixer(std::sync::Arc::new(client)),
            Err(e) => warn!("Automatic fixes disabled: {}", e),
        }
    }

    let snapshot = supervisor
        .start(&id, &dir, args.model.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Preview failed: {}", e))?;
    watch(&supervisor, &id, snapshot).await
}

/// Print where the preview lives, then block until Ctrl+C or a crash.
pub(crate) async fn watch(
    supervisor: &PreviewSupervisor,
    id: &str,
    snapshot: PreviewSnapshot,
) -> Result<()> {
    match (&snapshot.url, &snapshot.fallback_url) {
        (Some(url), _) => println!("🌐 Preview running at {}", url),
        (None, Some(url)) => println!("🌐 Preview started, probably at {}", url),
        (None, None) => println!("🌐 Preview started (pid {:?})", snapshot.pid),
    }
    println!("Press Ctrl+C to stop.");

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    let outcome = loop {
        tokio::select! {
            _ = &mut interrupted => break Ok(()),
            _ = tokio::time::sleep(STATUS_INTERVAL) => {
                let current = supervisor.status(id)?;
                if current.status == PreviewStatus::Failed {
                    for entry in current.logs.iter().rev().take(10).rev() {
                        eprintln!("  {}", entry.message);
                    }
                    break Err(anyhow::anyhow!(
                        "Preview failed: {}",
                        current.error.as_deref().unwrap_or("process exited")
                    ));
                }
            }
        }
    };

    let stopped = supervisor.shutdown_all().await;
    if stopped > 0 {
        println!("Stopped {} preview(s).", stopped);
    }
    outcome
}
