//! Signing key management
//!
//! The agent's signers double as SSH authentication keys and as credential
//! signing keys. They are loaded once at startup; the credential service
//! always uses the first signer in the list.

use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use tracing::{debug, warn};

use crate::error::SignerError;
use crate::ui::Ui;

/// A detached signature with its algorithm name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlob {
    /// Raw signature bytes
    pub blob: Vec<u8>,
    /// Signature algorithm, e.g. `ssh-ed25519`
    pub format: String,
}

/// A loaded signing key
#[derive(Clone)]
pub struct Signer {
    key: Arc<KeyPair>,
}

impl Signer {
    /// Wrap a key pair
    pub fn new(key: KeyPair) -> Self {
        Self { key: Arc::new(key) }
    }

    /// The underlying key pair, for SSH authentication
    pub fn key_pair(&self) -> Arc<KeyPair> {
        Arc::clone(&self.key)
    }

    /// SSH wire-format blob of the public key
    pub fn public_key_blob(&self) -> Vec<u8> {
        self.key.public_key_bytes()
    }

    /// Signature algorithm name
    pub fn algorithm(&self) -> &'static str {
        self.key.name()
    }

    /// Produce a detached signature over `data`
    pub fn sign(&self, data: &[u8]) -> Result<SignatureBlob, SignerError> {
        let signature = self
            .key
            .sign_detached(data)
            .map_err(|e| SignerError::Signing(e.to_string()))?;

        Ok(SignatureBlob {
            blob: signature.as_ref().to_vec(),
            format: self.key.name().to_string(),
        })
    }
}

/// Verify a detached signature against an SSH wire-format public key blob
pub fn verify_signature(public_key_blob: &[u8], data: &[u8], signature: &[u8]) -> bool {
    match russh_keys::parse_public_key_base64(&BASE64.encode(public_key_blob)) {
        Ok(key) => key.verify_detached(data, signature),
        Err(_) => false,
    }
}

/// Load the signers configured in `key_paths`, prompting through the UI
/// for passphrases when a key is encrypted. Missing files are skipped;
/// an empty result is a configuration error for the caller to surface.
pub async fn load_signers(key_paths: &[PathBuf], ui: &Arc<dyn Ui>) -> Vec<Signer> {
    let mut signers = Vec::new();

    for path in key_paths {
        if !path.exists() {
            debug!("Skipping missing key file {:?}", path);
            continue;
        }

        match russh_keys::load_secret_key(path, None) {
            Ok(key) => signers.push(Signer::new(key)),
            Err(russh_keys::Error::KeyIsEncrypted) => {
                let prompt = format!("Passphrase for {}", path.display());
                let Some(passphrase) = ui.ask_secret(&prompt).await else {
                    warn!("No passphrase provided for {:?}, skipping", path);
                    continue;
                };
                match russh_keys::load_secret_key(path, Some(&passphrase)) {
                    Ok(key) => signers.push(Signer::new(key)),
                    Err(e) => warn!("Failed to decrypt key {:?}: {}", path, e),
                }
            }
            Err(e) => warn!("Failed to load key {:?}: {}", path, e),
        }
    }

    signers
}
