//! relaysh controller binary

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use relaysh::{Console, Controller, ControllerConfig};
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "relaysh-server",
    about = "Controller for relaysh agents",
    after_help = "Type 'help' at the '>' prompt for the list of operator commands.",
    disable_help_flag = true
)]
struct Args {
    /// Address to listen on (default: 0.0.0.0)
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// Port to listen on (default: 4000)
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
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(host) = args.host {
        config.listen_host = host;
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    config.validate().context("Invalid configuration")?;

    let controller = Controller::bind(config)
        .await
        .context("Failed to start controller")?;
    let registry = controller.registry();
    let dispatcher = controller.dispatcher();
    let shutdown = controller.shutdown_token();
    let server = tokio::spawn(controller.run());

    // Ctrl-C is forwarded to the console instead of killing the process
    let (interrupt_tx, interrupt_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received");
            if interrupt_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let mut console = Console::new(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        registry,
        dispatcher,
        interrupt_rx,
    );
    let result = console.run().await;

    shutdown.cancel();
    if let Err(e) = server.await {
        error!("Controller task failed: {}", e);
    }
    result.context("Console failed")?;
    Ok(())
}
