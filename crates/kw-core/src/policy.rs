//! Policy decisions
//!
//! The policy owns the rule store and the UI. Denial is a normal outcome,
//! not an error: callers translate it into the appropriate wire reply.

use std::sync::Arc;
use thiserror::Error;

use kw_protocol::CredentialRequest;

use crate::scope::Scope;
use crate::store::{Rule, Store};
use crate::ui::{Approval, Ui};

/// A refused request, carrying the reason given to the requester
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct PolicyDenial {
    /// Why the request was refused
    pub reason: String,
}

impl PolicyDenial {
    /// A denial with the given reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Policy engine: persisted rules first, the user second
pub struct Policy {
    store: Store,
    ui: Arc<dyn Ui>,
}

impl Policy {
    /// Create a policy over a rule store and a UI
    pub fn new(store: Store, ui: Arc<dyn Ui>) -> Self {
        Self { store, ui }
    }

    /// The UI this policy prompts through
    pub fn ui(&self) -> &Arc<dyn Ui> {
        &self.ui
    }

    /// May `scope` run `command`?
    pub async fn request_approval(&self, scope: &Scope, command: &str) -> Result<(), PolicyDenial> {
        if self.store.approves_command(scope, command).await {
            return Ok(());
        }

        let prompt = format!(
            "Allow {} to run '{}' as {}@{}?",
            scope.client_name, command, scope.service_username, scope.service_hostname
        );
        match self.ui.prompt_approval(&prompt).await {
            Approval::Once => Ok(()),
            Approval::Always => {
                self.store
                    .remember(Rule {
                        client: scope.client_name.clone(),
                        user: scope.service_username.clone(),
                        server: scope.service_hostname.clone(),
                        command: command.to_string(),
                        ..Default::default()
                    })
                    .await;
                Ok(())
            }
            Approval::Deny => Err(PolicyDenial::new("approval denied by user")),
        }
    }

    /// May `scope` run arbitrary commands? Consulted when the stub tries
    /// to push the session beyond the approved command.
    pub async fn request_approval_for_all_commands(
        &self,
        scope: &Scope,
    ) -> Result<(), PolicyDenial> {
        if self.store.approves_all_commands(scope).await {
            return Ok(());
        }

        let prompt = format!(
            "Allow {} to run ANY command as {}@{}?",
            scope.client_name, scope.service_username, scope.service_hostname
        );
        match self.ui.prompt_approval(&prompt).await {
            Approval::Once => Ok(()),
            Approval::Always => {
                self.store
                    .remember(Rule {
                        client: scope.client_name.clone(),
                        user: scope.service_username.clone(),
                        server: scope.service_hostname.clone(),
                        all_commands: true,
                        ..Default::default()
                    })
                    .await;
                Ok(())
            }
            Approval::Deny => Err(PolicyDenial::new("approval denied by user")),
        }
    }

    /// May the client in `scope` obtain the requested credential?
    pub async fn request_credential_approval(
        &self,
        scope: &Scope,
        req: &CredentialRequest,
    ) -> Result<(), PolicyDenial> {
        if self.store.approves_credentials(scope).await {
            return Ok(());
        }

        let op = String::from_utf8_lossy(&req.op);
        let prompt = format!(
            "Allow {} ({}) to obtain a credential for '{}'?",
            scope.client_name,
            scope.client_endpoint(),
            op
        );
        match self.ui.prompt_approval(&prompt).await {
            Approval::Once => Ok(()),
            Approval::Always => {
                self.store
                    .remember(Rule {
                        client: scope.client_name.clone(),
                        credentials: true,
                        ..Default::default()
                    })
                    .await;
                Ok(())
            }
            Approval::Deny => Err(PolicyDenial::new("credential denied by user")),
        }
    }
}
