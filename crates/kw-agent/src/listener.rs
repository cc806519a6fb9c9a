//! Unix socket listener
//!
//! Accepts stub connections and spawns one handler task per connection.
//! A per-connection failure never takes the agent down.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::Agent;

/// Listener owning the agent and its shutdown token
pub struct AgentListener {
    agent: Arc<Agent>,
    cancel: CancellationToken,
}

impl AgentListener {
    /// Create a listener for the agent
    pub fn new(agent: Arc<Agent>, cancel: CancellationToken) -> Self {
        Self { agent, cancel }
    }

    /// Bind the socket and serve until cancelled
    pub async fn run(&self, socket_path: &Path) -> Result<()> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
        }
        // Replace a stale socket from a previous run
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("Failed to remove stale socket {:?}", socket_path))?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind {:?}", socket_path))?;
        info!("Agent listening on {:?}", socket_path);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Agent listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => self.spawn_connection(stream),
                        Err(e) => warn!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        let _ = std::fs::remove_file(socket_path);
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::UnixStream) {
        let agent = Arc::clone(&self.agent);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Connection handler cancelled");
                }
                result = agent.handle_connection(stream) => match result {
                    Ok(()) => info!("Connection closed"),
                    Err(e) => warn!("Connection closed with error: {}", e),
                },
            }
        });
    }
}
