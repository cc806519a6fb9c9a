//! Persistent policy rules

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{load_config, save_config};
use crate::error::ConfigError;
use crate::scope::Scope;

/// A remembered approval
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Rule {
    /// Client machine label the rule applies to (empty = any)
    pub client: String,
    /// Remote username
    pub user: String,
    /// Remote server
    pub server: String,
    /// Approved command; ignored when `all_commands` is set
    pub command: String,
    /// Approve any command for this user/server
    pub all_commands: bool,
    /// Approve credential requests from this client
    pub credentials: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RuleFile {
    #[serde(rename = "rule")]
    rules: Vec<Rule>,
}

/// Rule store backed by a TOML file
///
/// Reads never block behind a prompt; writes are serialized by the lock.
pub struct Store {
    path: PathBuf,
    rules: RwLock<Vec<Rule>>,
}

impl Store {
    /// Load the store, starting empty when the file does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let rules = if path.exists() {
            let file: RuleFile = load_config(path)?;
            info!("Loaded {} policy rules from {:?}", file.rules.len(), path);
            file.rules
        } else {
            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            rules: RwLock::new(rules),
        })
    }

    fn command_rule_matches(rule: &Rule, scope: &Scope, command: &str) -> bool {
        rule.user == scope.service_username
            && rule.server == scope.service_hostname
            && (rule.all_commands || rule.command == command)
    }

    /// Whether a remembered rule approves running `command` in `scope`
    pub async fn approves_command(&self, scope: &Scope, command: &str) -> bool {
        self.rules
            .read()
            .await
            .iter()
            .any(|rule| Self::command_rule_matches(rule, scope, command))
    }

    /// Whether a remembered rule approves all commands in `scope`
    pub async fn approves_all_commands(&self, scope: &Scope) -> bool {
        self.rules.read().await.iter().any(|rule| {
            rule.all_commands
                && rule.user == scope.service_username
                && rule.server == scope.service_hostname
        })
    }

    /// Whether a remembered rule approves credential requests from the
    /// client in `scope`
    pub async fn approves_credentials(&self, scope: &Scope) -> bool {
        self.rules
            .read()
            .await
            .iter()
            .any(|rule| rule.credentials && rule.client == scope.client_name)
    }

    /// Append a rule and persist the store
    pub async fn remember(&self, rule: Rule) {
        let mut rules = self.rules.write().await;
        if rules.contains(&rule) {
            return;
        }
        rules.push(rule);

        let file = RuleFile {
            rules: rules.clone(),
        };
        if let Err(e) = save_config(&self.path, &file) {
            warn!("Failed to persist policy rules to {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope {
            client_name: "laptop".to_string(),
            client_hostname: "10.0.0.2".to_string(),
            client_port: 2222,
            service_username: "alice".to_string(),
            service_hostname: "srv.example".to_string(),
        }
    }

    fn empty_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::load(&dir.path().join("policy.toml")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_empty_store_approves_nothing() {
        let (_dir, store) = empty_store();
        assert!(!store.approves_command(&scope(), "uptime").await);
        assert!(!store.approves_all_commands(&scope()).await);
        assert!(!store.approves_credentials(&scope()).await);
    }

    #[tokio::test]
    async fn test_remember_command_rule() {
        let (_dir, store) = empty_store();
        store
            .remember(Rule {
                user: "alice".to_string(),
                server: "srv.example".to_string(),
                command: "uptime".to_string(),
                ..Default::default()
            })
            .await;

        assert!(store.approves_command(&scope(), "uptime").await);
        assert!(!store.approves_command(&scope(), "rm -rf /").await);

        let mut other = scope();
        other.service_hostname = "other.example".to_string();
        assert!(!store.approves_command(&other, "uptime").await);
    }

    #[tokio::test]
    async fn test_all_commands_rule() {
        let (_dir, store) = empty_store();
        store
            .remember(Rule {
                user: "alice".to_string(),
                server: "srv.example".to_string(),
                all_commands: true,
                ..Default::default()
            })
            .await;

        assert!(store.approves_command(&scope(), "anything").await);
        assert!(store.approves_all_commands(&scope()).await);
    }

    #[tokio::test]
    async fn test_rules_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");

        {
            let store = Store::load(&path).unwrap();
            store
                .remember(Rule {
                    client: "laptop".to_string(),
                    credentials: true,
                    ..Default::default()
                })
                .await;
        }

        let reloaded = Store::load(&path).unwrap();
        assert!(reloaded.approves_credentials(&scope()).await);
    }
}
