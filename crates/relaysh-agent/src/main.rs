//! relaysh agent binary
//!
//! Runs in the background and keeps dialing the controller until it answers.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use relaysh_agent::{AgentConfig, AgentRuntime, HostInspector};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "relaysh-agent",
    about = "Remote command agent for relaysh",
    after_help = "The agent keeps running in the background and retries the controller every 3 seconds.",
    disable_help_flag = true
)]
struct Args {
    /// Controller IP address (default: 127.0.0.1)
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// Controller port (default: 4000)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(host) = args.host {
        config.server_host = host;
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    config.validate().context("Invalid configuration")?;

    let runtime = AgentRuntime::new(config, Arc::new(HostInspector));

    let shutdown = runtime.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    runtime.run().await?;
    Ok(())
}
