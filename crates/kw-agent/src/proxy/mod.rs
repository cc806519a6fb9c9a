//! SSH proxy
//!
//! Acts as the SSH client to the remote server while the stub holds the
//! TCP socket: server bytes flow through the `transport` stream (counted
//! by the meter), the stub's own SSH view runs over the `ssh_data` stream,
//! and the final handoff message goes out on `control`.

mod filter;
mod metered;
mod stub;

pub use filter::CommandFilter;
pub use metered::{Meter, MeteredStream};

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use russh::client;
use russh_keys::key::PublicKey;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use kw_core::{HostKeyVerification, KnownHostsError, KnownHostsStore, PolicyDenial, Scope, Signer, Ui};
use kw_protocol::{ControlCodec, HandoffComplete, HandoffFailed};

use crate::mux::{MuxError, MuxStream};
use stub::StubHandler;

/// How long the stub session keeps running after the command is injected,
/// flushing replies queued during injection
const HANDOFF_GRACE: Duration = Duration::from_millis(250);

/// Proxy failures; all of them surface to the stub as `HANDOFF_FAILED`
#[derive(Error, Debug)]
pub enum ProxyError {
    /// known_hosts had no usable entry for the target
    #[error("Failed to extract host key algorithms from known_hosts: {0}")]
    HostKeyAlgs(#[from] KnownHostsError),

    /// The server presented an unacceptable host key
    #[error("Host key verification failed: {0}")]
    HostKey(String),

    /// No authentication method was accepted
    #[error("Authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },

    /// The command filter blocked the session
    #[error("Command blocked: {0}")]
    Blocked(#[from] PolicyDenial),

    /// The remote server refused the approved command
    #[error("Remote server rejected command '{0}'")]
    Rejected(String),

    /// Multiplexer failure
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// SSH-level failure
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// One approved execution being proxied
pub struct ProxySession {
    /// The frozen authorization scope
    pub scope: Scope,
    /// Port of the remote SSH server
    pub port: u32,
    /// Filter gating the stub's channel requests
    pub filter: Arc<CommandFilter>,
    /// The agent's known_hosts view
    pub known_hosts: Arc<KnownHostsStore>,
    /// Authentication and signing keys, tried in order
    pub signers: Vec<Signer>,
    /// UI for TOFU confirmations and password fallback
    pub ui: Arc<dyn Ui>,
    /// Handshake timeout
    pub connect_timeout: Duration,
}

impl ProxySession {
    /// Run the proxy and write the final handoff message on `control`.
    ///
    /// A proxy failure is consumed here: it becomes `HANDOFF_FAILED` plus
    /// a UI notification. The returned error covers only failures to
    /// deliver that final message.
    pub async fn run(
        self,
        ssh_data: MuxStream,
        transport: MuxStream,
        control: &mut Framed<MuxStream, ControlCodec>,
    ) -> Result<(), MuxError> {
        let ui = Arc::clone(&self.ui);
        match self.drive(ssh_data, transport).await {
            Ok(next_transport_byte) => {
                info!("Handoff complete at transport byte {}", next_transport_byte);
                control
                    .send(
                        HandoffComplete {
                            next_transport_byte,
                        }
                        .into(),
                    )
                    .await?;
            }
            Err(e) => {
                warn!("Proxy session failed: {}", e);
                ui.inform(&format!("Execution failed: {}", e)).await;
                control
                    .send(HandoffFailed { msg: e.to_string() }.into())
                    .await?;
            }
        }
        Ok(())
    }

    /// Connect, authenticate, serve the stub until the approved command is
    /// injected, then freeze the meter and return the handoff offset.
    async fn drive(self, ssh_data: MuxStream, transport: MuxStream) -> Result<u32, ProxyError> {
        let host = self.scope.service_hostname.clone();

        let key_algs = self.known_hosts.preferred_key_algs(&host, self.port)?;
        let mut config = client::Config::default();
        config.preferred.key = Cow::Owned(key_algs);
        let config = Arc::new(config);

        let metered = MeteredStream::new(transport);
        let meter = metered.meter();

        let handler = UpstreamHandler {
            known_hosts: Arc::clone(&self.known_hosts),
            ui: Arc::clone(&self.ui),
            host: host.clone(),
            port: self.port,
        };

        let mut upstream =
            tokio::time::timeout(self.connect_timeout, client::connect_stream(config, metered, handler))
                .await
                .map_err(|_| ProxyError::Other("SSH handshake timed out".to_string()))??;

        self.authenticate(&mut upstream, &host).await?;

        // Serve the stub's SSH view until the command is through
        let stub_config = Arc::new(stub_server_config()?);
        let (handoff_tx, handoff_rx) = oneshot::channel();
        let stub_handler = StubHandler::new(Arc::clone(&self.filter), upstream, handoff_tx);

        let session = russh::server::run_stream(stub_config, ssh_data, stub_handler).await?;
        tokio::pin!(session);

        tokio::select! {
            res = &mut session => match res {
                Ok(()) => {
                    return Err(ProxyError::Other(
                        "stub session ended before the command was injected".to_string(),
                    ))
                }
                Err(e) => return Err(e),
            },
            sig = handoff_rx => match sig {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(ProxyError::Other(
                        "stub session ended before the command was injected".to_string(),
                    ))
                }
            },
        }

        // Keep driving the stub session briefly so the exec reply and any
        // early output queued during injection reach the stub
        let _ = tokio::time::timeout(HANDOFF_GRACE, &mut session).await;

        // Quiesce: all later reads see EOF, all later writes are dropped,
        // and the snapshot is taken under the meter lock.
        let next = meter.halt();
        Ok(next as u32)
    }

    async fn authenticate(
        &self,
        upstream: &mut client::Handle<UpstreamHandler>,
        host: &str,
    ) -> Result<(), ProxyError> {
        let user = &self.scope.service_username;

        for signer in &self.signers {
            if upstream
                .authenticate_publickey(user, signer.key_pair())
                .await?
            {
                info!("Authenticated {}@{} with {}", user, host, signer.algorithm());
                return Ok(());
            }
        }

        let prompt = format!("Password for {}@{}", user, host);
        if let Some(password) = self.ui.ask_secret(&prompt).await {
            if upstream.authenticate_password(user, &password).await? {
                info!("Authenticated {}@{} with password", user, host);
                return Ok(());
            }
        }

        Err(ProxyError::AuthFailed {
            user: user.clone(),
            host: host.to_string(),
        })
    }
}

/// SSH server config for the stub-facing side: fresh host key per process,
/// no authentication (policy already admitted the stub).
fn stub_server_config() -> Result<russh::server::Config, ProxyError> {
    let key = russh_keys::key::KeyPair::generate_ed25519()
        .ok_or_else(|| ProxyError::Other("failed to generate stub host key".to_string()))?;

    let mut config = russh::server::Config::default();
    config.keys.push(key);
    config.methods = russh::MethodSet::NONE;
    config.auth_rejection_time = Duration::from_secs(0);
    Ok(config)
}

/// Client-side handler for the connection to the real server
pub(crate) struct UpstreamHandler {
    known_hosts: Arc<KnownHostsStore>,
    ui: Arc<dyn Ui>,
    host: String,
    port: u32,
}

#[async_trait]
impl client::Handler for UpstreamHandler {
    type Error = ProxyError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            HostKeyVerification::Verified => Ok(true),
            HostKeyVerification::Unknown { fingerprint } => {
                let prompt = format!(
                    "The authenticity of host {}:{} can't be established.\n\
                     Key fingerprint is {}.\n\
                     Continue connecting?",
                    self.host, self.port, fingerprint
                );
                if self.ui.confirm(&prompt).await {
                    if let Err(e) =
                        self.known_hosts
                            .add_host(&self.host, self.port, server_public_key)
                    {
                        warn!("Failed to record host key: {}", e);
                    }
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(ProxyError::HostKey(format!(
                "host key for {}:{} changed: expected {}, got {}",
                self.host, self.port, expected_fingerprint, actual_fingerprint
            ))),
        }
    }
}

/// Split a `host[:port]` target, defaulting to the SSH port
pub fn split_host_port(server: &str) -> (String, u32) {
    match server.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u32>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (server.to_string(), 22),
        },
        None => (server.to_string(), 22),
    }
}
