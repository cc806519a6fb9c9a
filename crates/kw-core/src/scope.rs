//! The authorization scope

use std::fmt;

/// Identifies both ends of an authorization: who is asking and what they
/// want to reach.
///
/// A scope starts empty on a fresh connection, is populated by the
/// forwarding notice (client side) and the execution request (service
/// side), and is never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    /// Human-readable label for the client machine
    pub client_name: String,
    /// Hostname of the stub's host, used to verify credential challenges
    pub client_hostname: String,
    /// Port of the client's elevation helper
    pub client_port: u32,
    /// Username on the target service
    pub service_username: String,
    /// Hostname of the target service
    pub service_hostname: String,
}

impl Scope {
    /// Whether the client side has been populated by a forwarding notice
    pub fn has_client(&self) -> bool {
        !self.client_hostname.is_empty()
    }

    /// The client endpoint in `host:port` form
    pub fn client_endpoint(&self) -> String {
        format!("{}:{}", self.client_hostname, self.client_port)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} -> {}@{}",
            self.client_name, self.client_hostname, self.service_username, self.service_hostname
        )
    }
}
