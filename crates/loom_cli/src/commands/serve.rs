//! Serve command - expose the engine over HTTP.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use super::{build_engine, load_settings};
use crate::server::{start_server, AppState, ServerConfig};

#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8787)]
    port: u16,

    /// Allow cross-origin requests
    #[arg(long)]
    cors: bool,
}

pub async fn execute(args: ServeArgs) -> Result<()> {
    let settings = load_settings()?;
    let (orchestrator, supervisor) = build_engine(&settings)?;
    let state = Arc::new(AppState::new(orchestrator, supervisor));

    start_server(
        ServerConfig {
            host: args.host,
            port: args.port,
            cors: args.cors,
        },
        state,
    )
    .await
}
