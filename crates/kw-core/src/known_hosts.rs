//! known_hosts management
//!
//! Parses the user's OpenSSH known_hosts file and answers the three
//! questions the agent needs: does this key belong to that endpoint, which
//! host key algorithms should the SSH client offer for it, and (after a
//! TOFU confirmation) how to record a new key.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh_keys::key::{self, Name, PublicKey};
use russh_keys::PublicKeyBase64;
use tracing::{debug, info, warn};

use crate::error::KnownHostsError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry
    Verified,
    /// Host not present (first connection)
    Unknown { fingerprint: String },
    /// A different key is recorded for this host (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// One known_hosts entry: key type name and base64 key blob
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_b64: String,
}

/// Parsed view of a known_hosts file
pub struct KnownHostsStore {
    /// host lookup key -> entries in file order
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    /// Path of the backing file
    path: PathBuf,
}

impl KnownHostsStore {
    /// Load the store from a known_hosts file. A missing file yields an
    /// empty store.
    pub fn load(path: &Path) -> Result<Self, KnownHostsError> {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.to_path_buf(),
        };

        if !path.exists() {
            debug!("known_hosts file {:?} does not exist, starting empty", path);
            return Ok(store);
        }

        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut entry_count = 0;

        {
            let mut hosts = store.hosts.write().expect("known_hosts lock poisoned");
            for line in reader.lines() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                // hostname[,alias...] keytype base64key [comment]
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() < 3 {
                    continue;
                }

                let entry = HostKeyEntry {
                    key_type: parts[1].to_string(),
                    key_b64: parts[2].to_string(),
                };

                for hostname in parts[0].split(',') {
                    // Hashed hostnames cannot be matched by name
                    if hostname.starts_with('|') {
                        continue;
                    }
                    hosts
                        .entry(hostname.to_lowercase())
                        .or_default()
                        .push(entry.clone());
                    entry_count += 1;
                }
            }
        }

        info!("Loaded {} known host entries from {:?}", entry_count, path);
        Ok(store)
    }

    /// Lookup key for host:port, matching OpenSSH conventions
    fn make_key(host: &str, port: u32) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    fn entries_for(&self, host: &str, port: u32) -> Vec<HostKeyEntry> {
        let hosts = self.hosts.read().expect("known_hosts lock poisoned");
        if let Some(entries) = hosts.get(&Self::make_key(host, port)) {
            return entries.clone();
        }
        // Fall back to the bare hostname for non-default ports recorded
        // without brackets
        hosts.get(&host.to_lowercase()).cloned().unwrap_or_default()
    }

    /// Verify a server public key for an endpoint
    pub fn verify(&self, host: &str, port: u32, key: &PublicKey) -> HostKeyVerification {
        let actual_b64 = key.public_key_base64();
        let actual_type = key.name();
        let fingerprint = key.fingerprint();

        let entries = self.entries_for(host, port);
        if entries.is_empty() {
            debug!("Unknown host: {}", Self::make_key(host, port));
            return HostKeyVerification::Unknown { fingerprint };
        }

        for entry in &entries {
            if entry.key_type != actual_type {
                continue;
            }
            if entry.key_b64 == actual_b64 {
                debug!("Host key verified for {}:{}", host, port);
                return HostKeyVerification::Verified;
            }
            let expected_fingerprint = fingerprint_of_b64(&entry.key_b64);
            warn!(
                "Host key changed for {}:{}! expected {}, got {}",
                host, port, expected_fingerprint, fingerprint
            );
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        // Host known, but no key of this type recorded
        debug!(
            "Host {}:{} known but has no {} key, treating as new",
            host, port, actual_type
        );
        HostKeyVerification::Unknown { fingerprint }
    }

    /// Check whether a raw SSH wire-format key blob is recorded for an
    /// endpoint. Used to verify credential challenges against the client's
    /// own host.
    pub fn contains_blob(&self, host: &str, port: u32, blob: &[u8]) -> bool {
        // Reject blobs that do not parse as public keys at all
        let b64 = BASE64.encode(blob);
        if russh_keys::parse_public_key_base64(&b64).is_err() {
            return false;
        }
        self.entries_for(host, port)
            .iter()
            .any(|entry| entry.key_b64 == b64)
    }

    /// Host key algorithms to offer for an endpoint, ordered by the
    /// known_hosts entries. An endpoint with no usable entries is an error:
    /// the proxy must not dial a host the user has never seen.
    pub fn preferred_key_algs(&self, host: &str, port: u32) -> Result<Vec<Name>, KnownHostsError> {
        let mut algs: Vec<Name> = Vec::new();
        for entry in self.entries_for(host, port) {
            let names: &[Name] = match entry.key_type.as_str() {
                "ssh-ed25519" => &[key::ED25519],
                "ssh-rsa" => &[key::RSA_SHA2_512, key::RSA_SHA2_256, key::SSH_RSA],
                other => {
                    debug!("Skipping unsupported host key type {}", other);
                    &[]
                }
            };
            for name in names {
                if !algs.contains(name) {
                    algs.push(*name);
                }
            }
        }

        if algs.is_empty() {
            return Err(KnownHostsError::NoHostKeys {
                endpoint: Self::make_key(host, port),
            });
        }
        Ok(algs)
    }

    /// Record a newly confirmed host key, both in memory and in the file
    pub fn add_host(&self, host: &str, port: u32, key: &PublicKey) -> Result<(), KnownHostsError> {
        let lookup = Self::make_key(host, port);
        let entry = HostKeyEntry {
            key_type: key.name().to_string(),
            key_b64: key.public_key_base64(),
        };

        {
            let mut hosts = self.hosts.write().expect("known_hosts lock poisoned");
            hosts.entry(lookup.clone()).or_default().push(entry.clone());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup, entry.key_type, entry.key_b64)?;

        info!("Added host key for {} to {:?}", lookup, self.path);
        Ok(())
    }
}

/// SHA256 fingerprint of a stored base64 key blob
fn fingerprint_of_b64(key_b64: &str) -> String {
    match russh_keys::parse_public_key_base64(key_b64) {
        Ok(key) => key.fingerprint(),
        Err(_) => "unparseable".to_string(),
    }
}
