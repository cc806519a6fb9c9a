//! Agent construction

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use kw_core::config::AgentConfig;
use kw_core::signer::load_signers;
use kw_core::{KnownHostsStore, Policy, Signer, Store, Ui};

/// The guardian agent: policy, known hosts and signing keys, shared by
/// every stub connection.
pub struct Agent {
    config: AgentConfig,
    policy: Arc<Policy>,
    known_hosts: Arc<KnownHostsStore>,
    signers: Vec<Signer>,
}

impl Agent {
    /// Build an agent from its configuration, loading the policy store,
    /// known_hosts and signing keys.
    pub async fn new(config: AgentConfig, ui: Arc<dyn Ui>) -> Result<Self> {
        let store = Store::load(&config.policy_path)
            .with_context(|| format!("Failed to load policy store from {:?}", config.policy_path))?;

        let known_hosts = KnownHostsStore::load(&config.known_hosts_path)
            .with_context(|| format!("Failed to load known_hosts from {:?}", config.known_hosts_path))?;

        let signers = load_signers(&config.key_paths, &ui).await;
        if signers.is_empty() {
            ui.inform("No signing keys could be loaded; credential requests will be denied")
                .await;
        } else {
            info!("Loaded {} signing key(s)", signers.len());
        }

        Ok(Self::from_parts(config, Policy::new(store, ui), known_hosts, signers))
    }

    /// Assemble an agent from already-built parts
    pub fn from_parts(
        config: AgentConfig,
        policy: Policy,
        known_hosts: KnownHostsStore,
        signers: Vec<Signer>,
    ) -> Self {
        Self {
            config,
            policy: Arc::new(policy),
            known_hosts: Arc::new(known_hosts),
            signers,
        }
    }

    /// The agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The policy engine
    pub(crate) fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    /// The known_hosts view
    pub(crate) fn known_hosts(&self) -> &Arc<KnownHostsStore> {
        &self.known_hosts
    }

    /// The signer list; the credential service always uses the first entry
    pub(crate) fn signers(&self) -> &[Signer] {
        &self.signers
    }

    /// The UI the policy prompts through
    pub fn ui(&self) -> Arc<dyn Ui> {
        Arc::clone(self.policy.ui())
    }
}
