//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for the guardian agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Unix socket the agent listens on
    pub socket_path: PathBuf,

    /// Path to the user's known_hosts file
    pub known_hosts_path: PathBuf,

    /// Path to the persisted policy rules
    pub policy_path: PathBuf,

    /// Private keys used for SSH authentication and credential signing,
    /// tried in order
    pub key_paths: Vec<PathBuf>,

    /// Default username for outbound SSH when the request omits one
    pub default_username: String,

    /// Timeout applied to the remote SSH handshake
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let ssh_dir = dirs::home_dir().unwrap_or_default().join(".ssh");
        Self {
            socket_path: default_runtime_dir().join("agent.sock"),
            known_hosts_path: ssh_dir.join("known_hosts"),
            policy_path: default_config_dir().join("policy.toml"),
            key_paths: vec![ssh_dir.join("id_ed25519"), ssh_dir.join("id_rsa")],
            default_username: whoami::username(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keywarden")
}

/// Get the directory holding the agent socket
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(|| std::env::temp_dir().join("keywarden"))
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("agent.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    Ok(toml::from_str(&content)?)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Serialize a `Duration` as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
