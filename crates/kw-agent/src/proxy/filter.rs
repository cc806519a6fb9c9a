//! Command filter
//!
//! Gates what the stub may push through the proxied SSH channel: the exec
//! request must match the approved command, and anything beyond it (a
//! different command, or follow-up channel data) re-consults policy for
//! blanket approval. The escalation happens at most once per session.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use kw_core::{Policy, PolicyDenial, Scope};

/// Channel interceptor bound to one approved command
pub struct CommandFilter {
    approved: String,
    scope: Scope,
    policy: Arc<Policy>,
    /// Whether the all-commands escalation has been granted
    escalated: Mutex<bool>,
}

impl CommandFilter {
    /// Create a filter for the approved command
    pub fn new(approved: String, scope: Scope, policy: Arc<Policy>) -> Self {
        Self {
            approved,
            scope,
            policy,
            escalated: Mutex::new(false),
        }
    }

    /// The command this filter was built for
    pub fn approved_command(&self) -> &str {
        &self.approved
    }

    /// Gate an exec request from the stub
    pub async fn check_exec(&self, command: &str) -> Result<(), PolicyDenial> {
        if command == self.approved {
            return Ok(());
        }
        info!(
            "Stub requested '{}' instead of approved '{}', escalating",
            command, self.approved
        );
        self.escalate().await
    }

    /// Gate channel data beyond the approved command
    pub async fn check_data(&self) -> Result<(), PolicyDenial> {
        self.escalate().await
    }

    /// Consult policy for all-commands approval, once
    async fn escalate(&self) -> Result<(), PolicyDenial> {
        let mut escalated = self.escalated.lock().await;
        if *escalated {
            return Ok(());
        }
        self.policy
            .request_approval_for_all_commands(&self.scope)
            .await?;
        *escalated = true;
        Ok(())
    }
}
