//! Keywarden guardian agent daemon
//!
//! Holds the user's SSH keys and policy, authorizes delegated command
//! executions requested by local stubs, and issues signed credentials.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kw_agent::{Agent, AgentListener};
use kw_core::config::{self, AgentConfig};
use kw_core::{AskPassUi, TerminalUi, Ui};

#[derive(Parser)]
#[command(name = "kw-agent")]
#[command(about = "Keywarden guardian agent")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket path to listen on (overrides config and KEYWARDEN_SOCKET)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Prompt through an askpass dialog instead of the terminal
    #[arg(long)]
    askpass: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Keywarden agent starting...");

    let mut agent_config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                AgentConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            AgentConfig::default()
        }
    };

    if let Some(socket) = args.socket {
        agent_config.socket_path = socket;
    } else if let Some(socket) = std::env::var_os("KEYWARDEN_SOCKET") {
        agent_config.socket_path = PathBuf::from(socket);
    }

    let ui: Arc<dyn Ui> = if args.askpass {
        Arc::new(AskPassUi::from_env())
    } else {
        Arc::new(TerminalUi::new())
    };

    tracing::info!("Socket: {:?}", agent_config.socket_path);
    tracing::info!("known_hosts: {:?}", agent_config.known_hosts_path);

    let socket_path = agent_config.socket_path.clone();
    let agent = Arc::new(
        Agent::new(agent_config, ui)
            .await
            .with_context(|| "Failed to initialize agent")?,
    );

    let cancel = CancellationToken::new();
    let listener = AgentListener::new(agent, cancel.clone());

    tokio::select! {
        result = listener.run(&socket_path) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down");
            cancel.cancel();
        }
    }

    Ok(())
}
