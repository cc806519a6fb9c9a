//! Core error types

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// known_hosts errors
#[derive(Error, Debug)]
pub enum KnownHostsError {
    /// No usable host key entry for the given endpoint
    #[error("No known_hosts entry for {endpoint}")]
    NoHostKeys { endpoint: String },

    /// I/O error reading or writing the file
    #[error("known_hosts I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Signing key errors
#[derive(Error, Debug)]
pub enum SignerError {
    /// The agent has no usable signing keys
    #[error("No signing keys available")]
    NoSigners,

    /// A key file could not be loaded
    #[error("Failed to load key from {path}: {message}")]
    KeyLoad { path: PathBuf, message: String },

    /// Producing the signature failed
    #[error("Signing failed: {0}")]
    Signing(String),
}
