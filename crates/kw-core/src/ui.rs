//! User interaction boundary
//!
//! The agent never talks to the user directly; everything goes through the
//! [`Ui`] trait. Two implementations exist: a line-oriented terminal UI for
//! foreground use, and an askpass-style dialog UI for sessions without a
//! controlling terminal.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

/// Outcome of an approval prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// Approve this request only
    Once,
    /// Approve and remember as a rule
    Always,
    /// Refuse
    Deny,
}

/// Capabilities the agent needs from the user
#[async_trait]
pub trait Ui: Send + Sync {
    /// Best-effort notification; never fails observably
    async fn inform(&self, text: &str);

    /// Ask the user to approve a request
    async fn prompt_approval(&self, text: &str) -> Approval;

    /// Ask a yes/no question (e.g. trusting an unknown host key)
    async fn confirm(&self, text: &str) -> bool;

    /// Ask for a secret such as a key passphrase or login password
    async fn ask_secret(&self, prompt: &str) -> Option<String>;
}

/// Line-oriented UI on the agent's controlling terminal
#[derive(Debug, Default)]
pub struct TerminalUi;

impl TerminalUi {
    /// Create a terminal UI
    pub fn new() -> Self {
        Self
    }

    async fn read_line(&self) -> Option<String> {
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim().to_string()),
            Err(e) => {
                warn!("Failed to read from terminal: {}", e);
                None
            }
        }
    }

    async fn write_prompt(&self, text: &str) {
        let mut stderr = tokio::io::stderr();
        let _ = stderr.write_all(text.as_bytes()).await;
        let _ = stderr.flush().await;
    }
}

#[async_trait]
impl Ui for TerminalUi {
    async fn inform(&self, text: &str) {
        self.write_prompt(&format!("{}\n", text)).await;
    }

    async fn prompt_approval(&self, text: &str) -> Approval {
        self.write_prompt(&format!("{} [y]es/[a]lways/[N]o: ", text))
            .await;
        match self.read_line().await.as_deref() {
            Some("y") | Some("yes") => Approval::Once,
            Some("a") | Some("always") => Approval::Always,
            _ => Approval::Deny,
        }
    }

    async fn confirm(&self, text: &str) -> bool {
        self.write_prompt(&format!("{} [y/N]: ", text)).await;
        matches!(self.read_line().await.as_deref(), Some("y") | Some("yes"))
    }

    async fn ask_secret(&self, prompt: &str) -> Option<String> {
        self.write_prompt(&format!("{}: ", prompt)).await;
        self.read_line().await.filter(|s| !s.is_empty())
    }
}

/// UI that delegates to an askpass-style helper program
///
/// The helper receives the prompt as its single argument; its exit status
/// answers yes/no questions and its first stdout line carries secrets.
#[derive(Debug)]
pub struct AskPassUi {
    program: PathBuf,
}

impl AskPassUi {
    /// Use the program from `SSH_ASKPASS`, falling back to `ssh-askpass`
    pub fn from_env() -> Self {
        let program = std::env::var_os("SSH_ASKPASS")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ssh-askpass"));
        Self { program }
    }

    /// Use a specific helper program
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    async fn run(&self, prompt: &str) -> Option<(bool, String)> {
        let output = tokio::process::Command::new(&self.program)
            .arg(prompt)
            .output()
            .await;
        match output {
            Ok(output) => {
                let line = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .unwrap_or("")
                    .to_string();
                Some((output.status.success(), line))
            }
            Err(e) => {
                warn!("Failed to run askpass helper {:?}: {}", self.program, e);
                None
            }
        }
    }
}

#[async_trait]
impl Ui for AskPassUi {
    async fn inform(&self, text: &str) {
        let _ = self.run(text).await;
    }

    async fn prompt_approval(&self, text: &str) -> Approval {
        match self.run(text).await {
            Some((true, _)) => Approval::Once,
            _ => Approval::Deny,
        }
    }

    async fn confirm(&self, text: &str) -> bool {
        matches!(self.run(text).await, Some((true, _)))
    }

    async fn ask_secret(&self, prompt: &str) -> Option<String> {
        match self.run(prompt).await {
            Some((true, line)) if !line.is_empty() => Some(line),
            _ => None,
        }
    }
}
