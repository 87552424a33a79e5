//! CLI command definitions.
//!
//! Each subcommand builds the engine from workspace settings and drives it
//! from the terminal or over HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loom_core::Orchestrator;
use loom_llm::LlmClient;
use loom_runner::PreviewSupervisor;

use crate::settings::Settings;

pub mod generate;
pub mod preview;
pub mod serve;

/// AppLoom - turn a description into a running application
#[derive(Parser)]
#[command(name = "loom")]
#[command(version, about = "AppLoom - turn a description into a running application")]
#[command(long_about = r#"
AppLoom generates a project from a natural-language description, previews it
as a live process and refines it from feedback.

COMMANDS:
  generate  → Run the generation pipeline and print progress
  preview   → Launch an existing project directory as a preview
  serve     → Expose generation and previews over HTTP

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Generation failed
  4 - Preview failed
  5 - Not configured (missing API key)

Settings are read from .loom/settings.json in the current directory.
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a project from a description
    Generate(generate::GenerateArgs),

    /// Preview a project directory
    Preview(preview::PreviewArgs),

    /// Run the HTTP API
    Serve(serve::ServeArgs),
}

/// Load settings from the current directory.
pub(crate) fn load_settings() -> Result<Settings> {
    let current_dir = std::env::current_dir()?;
    Settings::load(&current_dir)
}

/// Orchestrator and supervisor backed by the configured LLM endpoint.
pub(crate) fn build_engine(settings: &Settings) -> Result<(Orchestrator, PreviewSupervisor)> {
    let client = Arc::new(
        LlmClient::new(settings.llm.clone()).context("LLM client is not configured")?,
    );
    let orchestrator = Orchestrator::new(client.clone(), settings.pipeline.clone());
    let supervisor = PreviewSupervisor::new(settings.supervisor.clone()).with_fixer(client);
    Ok((orchestrator, supervisor))
}
