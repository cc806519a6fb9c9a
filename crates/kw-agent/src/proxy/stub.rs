//! Stub-facing SSH endpoint
//!
//! The stub speaks SSH on the `ssh_data` stream. The agent terminates that
//! session (ephemeral host key, no authentication: the stub has already
//! been admitted by policy), gates its exec request through the command
//! filter, and bridges the channel to the real server until handoff.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::filter::CommandFilter;
use super::{ProxyError, UpstreamHandler};

/// Stdin chunks queued toward the upstream channel
const STDIN_QUEUE: usize = 32;

/// Server-side handler for the stub's SSH session
pub(crate) struct StubHandler {
    filter: Arc<CommandFilter>,
    /// Client handle to the real server; kept alive for the whole session
    upstream: client::Handle<UpstreamHandler>,
    /// Whether the approved command has been injected
    injected: bool,
    /// Fires once the approved command has been accepted upstream
    handoff_tx: Option<oneshot::Sender<Result<(), ProxyError>>>,
    /// Stdin relay toward the upstream channel, present after exec
    stdin_tx: Option<mpsc::Sender<Bytes>>,
}

impl StubHandler {
    pub(crate) fn new(
        filter: Arc<CommandFilter>,
        upstream: client::Handle<UpstreamHandler>,
        handoff_tx: oneshot::Sender<Result<(), ProxyError>>,
    ) -> Self {
        Self {
            filter,
            upstream,
            injected: false,
            handoff_tx: Some(handoff_tx),
            stdin_tx: None,
        }
    }

    fn signal(&mut self, result: Result<(), ProxyError>) {
        if let Some(tx) = self.handoff_tx.take() {
            let _ = tx.send(result);
        }
    }
}

#[async_trait]
impl Handler for StubHandler {
    type Error = ProxyError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!("Stub session authenticated as '{}'", user);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Stub opened channel {:?}", channel.id());
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();

        if let Err(denial) = self.filter.check_exec(&command).await {
            warn!("Exec request '{}' blocked: {}", command, denial);
            session.channel_failure(channel);
            return Ok(());
        }

        if self.injected {
            warn!("Stub sent a second exec request, refusing");
            session.channel_failure(channel);
            return Ok(());
        }

        match inject_command(&mut self.upstream, &command).await {
            Ok((upstream_channel, early_output)) => {
                info!("Injected command '{}' into the remote session", command);
                self.injected = true;
                session.channel_success(channel);

                let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
                self.stdin_tx = Some(stdin_tx);
                tokio::spawn(relay_channel(
                    upstream_channel,
                    early_output,
                    session.handle(),
                    channel,
                    stdin_rx,
                ));

                self.signal(Ok(()));
                Ok(())
            }
            Err(e) => {
                session.channel_failure(channel);
                self.signal(Err(e));
                Ok(())
            }
        }
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Anything beyond the approved command needs blanket approval
        self.filter.check_data().await?;

        if let Some(tx) = &self.stdin_tx {
            let _ = tx.send(Bytes::copy_from_slice(data)).await;
        } else {
            debug!("Dropping {} bytes of channel data before exec", data.len());
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender forwards EOF upstream
        self.stdin_tx = None;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Stub closed channel {:?}", channel);
        self.stdin_tx = None;
        Ok(())
    }
}

/// Open a session channel on the real server and inject the command.
/// Returns the live channel plus any output that raced the exec reply.
async fn inject_command(
    upstream: &mut client::Handle<UpstreamHandler>,
    command: &str,
) -> Result<(Channel<client::Msg>, Vec<CryptoVec>), ProxyError> {
    let mut channel = upstream.channel_open_session().await?;
    channel.exec(true, command.as_bytes()).await?;

    let mut early_output = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok((channel, early_output)),
            Some(ChannelMsg::Failure) => {
                return Err(ProxyError::Rejected(command.to_string()));
            }
            Some(ChannelMsg::Data { data }) => early_output.push(data),
            Some(ChannelMsg::ExtendedData { data, .. }) => early_output.push(data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(ProxyError::Other(
                    "remote channel closed before confirming the command".to_string(),
                ));
            }
            Some(_) => continue,
        }
    }
}

/// Pump the upstream channel to the stub and stub stdin upstream, until
/// either side goes away.
async fn relay_channel(
    mut upstream: Channel<client::Msg>,
    early_output: Vec<CryptoVec>,
    stub: russh::server::Handle,
    stub_channel: ChannelId,
    mut stdin_rx: mpsc::Receiver<Bytes>,
) {
    for data in early_output {
        if stub.data(stub_channel, data).await.is_err() {
            return;
        }
    }

    let mut stdin_open = true;
    loop {
        tokio::select! {
            msg = upstream.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if stub.data(stub_channel, data).await.is_err() {
                        return;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    let _ = stub.exit_status_request(stub_channel, exit_status).await;
                }
                Some(ChannelMsg::Eof) => {
                    let _ = stub.eof(stub_channel).await;
                }
                Some(ChannelMsg::Close) | None => {
                    let _ = stub.close(stub_channel).await;
                    return;
                }
                Some(_) => {}
            },
            chunk = stdin_rx.recv(), if stdin_open => match chunk {
                Some(chunk) => {
                    if upstream.data(&chunk[..]).await.is_err() {
                        return;
                    }
                }
                None => {
                    stdin_open = false;
                    let _ = upstream.eof().await;
                }
            },
        }
    }
}
