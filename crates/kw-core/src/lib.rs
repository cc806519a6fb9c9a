//! kw-core: Shared services for the Keywarden guardian agent
//!
//! This crate provides the pieces the agent daemon composes: configuration,
//! the authorization scope, the known_hosts store, the policy engine with
//! its persistent rule store, the user-interaction boundary, and signing
//! key management.

pub mod config;
pub mod error;
pub mod known_hosts;
pub mod policy;
pub mod scope;
pub mod signer;
pub mod store;
pub mod ui;

pub use error::{ConfigError, KnownHostsError, SignerError};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use policy::{Policy, PolicyDenial};
pub use scope::Scope;
pub use signer::{Signer, SignatureBlob};
pub use store::{Rule, Store};
pub use ui::{Approval, AskPassUi, TerminalUi, Ui};
