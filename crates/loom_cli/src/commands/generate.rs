//! Generate command - run the pipeline for a description and report progress.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use loom_core::{GenerationOptions, SessionStatus};
use tracing::info;

use super::{build_engine, load_settings};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Args)]
pub struct GenerateArgs {
    /// What the application should do
    description: String,

    /// Plain HTML/CSS/JS without a backend
    #[arg(long)]
    static_site: bool,

    /// Force an API service layer
    #[arg(long)]
    api: bool,

    /// Force a database layer
    #[arg(long)]
    database: bool,

    /// Model to generate with
    #[arg(short, long, env = "LOOM_MODEL")]
    model: Option<String>,

    /// Project directory (defaults to <outputRoot>/<session id>)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Launch a preview once generation completes
    #[arg(long)]
    preview: bool,
}

pub async fn execute(args: GenerateArgs) -> Result<()> {
    let settings = load_settings()?;
    let (orchestrator, supervisor) = build_engine(&settings)?;

    let mut options = GenerationOptions {
        static_site: args.static_site,
        api_service: args.api,
        requires_database: args.database,
        ..GenerationOptions::default()
    };
    if let Some(model) = args.model {
        options = options.with_model(model);
    }
    if let Some(output) = args.output {
        options = options.with_target_dir(output);
    }

    let id = orchestrator.submit(&args.description, options)?;
    println!("🧵 Session {}", id);

    let mut last_step = String::new();
    let record = loop {
        let record = orchestrator.status(&id)?;
        if record.current_step != last_step {
            println!("  [{:>3}%] {}", record.progress, record.current_step);
            last_step = record.current_step.clone();
        }
        if record.status.is_terminal() {
            break record;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    if record.status != SessionStatus::Completed {
        bail!(
            "Generation failed: {}",
            record.error.as_deref().unwrap_or("unknown error")
        );
    }

    let session = orchestrator.session(&id)?;
    println!("✅ Project written to {}", session.target_dir.display());

    if !args.preview {
        return Ok(());
    }

    let model = session.model(&orchestrator.config().default_model).to_string();
    info!("Starting preview for {}", id);
    let snapshot = supervisor
        .start(&id, &session.target_dir, Some(&model))
        .await
        .map_err(|e| anyhow::anyhow!("Preview failed: {}", e))?;
    super::preview::watch(&supervisor, &id, snapshot).await
}
