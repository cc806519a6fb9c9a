//! Per-connection session state machine
//!
//! A fresh connection starts unidentified (S0), becomes identified once a
//! forwarding notice arrives (S1), and is consumed by the SSH proxy when
//! an execution request is approved. Credential requests and extension
//! probes are handled without leaving S1. Anything else terminates the
//! connection with `AGENT_FAILURE`.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use kw_core::Scope;
use kw_protocol::{
    AgentExtension, ControlCodec, ControlPacket, CredentialRequest, ExecutionRequest,
    ForwardingNotice, MsgNum, ProtocolError, GUARD_EXTENSION_TYPE,
};

use crate::agent::Agent;
use crate::error::AgentError;
use crate::proxy::split_host_port;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Awaiting the first message
    Fresh,
    /// Client identity recorded
    Identified,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Fresh => "fresh",
            SessionState::Identified => "identified",
        }
    }
}

impl Agent {
    /// Drive the dialogue with one stub connection to completion.
    ///
    /// Clean EOF at a packet boundary returns Ok; protocol violations are
    /// answered with `AGENT_FAILURE` before the error is returned.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.ui().inform("New incoming connection").await;

        let mut framed = Framed::new(stream, ControlCodec::new());
        let mut scope = Scope::default();
        let mut state = SessionState::Fresh;

        loop {
            let packet = match framed.next().await {
                // EOF at a message boundary is a clean close
                None => return Ok(()),
                Some(Ok(packet)) => packet,
                Some(Err(ProtocolError::UnknownMsgNum(num))) => {
                    let _ = framed
                        .send(ControlPacket::empty(MsgNum::AgentFailure))
                        .await;
                    return Err(AgentError::UnknownMessage(num));
                }
                Some(Err(e)) => return Err(e.into()),
            };

            debug!("Got control packet {:?} in state {}", packet.msg_num, state.name());

            match packet.msg_num {
                MsgNum::ForwardingNotice => {
                    let notice = ForwardingNotice::decode(&packet.payload)?;
                    scope.client_name = notice.readable_name;
                    scope.client_hostname = notice.host;
                    scope.client_port = notice.port;
                    state = SessionState::Identified;
                }

                MsgNum::ExecutionRequest => {
                    if state != SessionState::Identified {
                        return self.reject(&mut framed, packet.msg_num, state).await;
                    }
                    let req = ExecutionRequest::decode(&packet.payload)?;
                    let (host, port) = split_host_port(&req.server);
                    scope.service_username = req.user;
                    scope.service_hostname = host;
                    return self
                        .handle_execution_request(framed, scope, req.command, port)
                        .await;
                }

                MsgNum::CredentialRequest => {
                    if state != SessionState::Identified {
                        return self.reject(&mut framed, packet.msg_num, state).await;
                    }
                    let req = CredentialRequest::decode_payload(&packet.payload)?;
                    if let Err(e) = self.handle_credential_request(&mut framed, &scope, req).await {
                        self.ui()
                            .inform(&format!(
                                "Error handling credential request from {}: {}",
                                scope.client_name, e
                            ))
                            .await;
                    }
                }

                MsgNum::AgentcExtension => {
                    let ext = AgentExtension::decode(&packet.payload)?;
                    if ext.extension_type == GUARD_EXTENSION_TYPE {
                        framed
                            .send(ControlPacket::empty(MsgNum::AgentSuccess))
                            .await?;
                        continue;
                    }
                    warn!("Unsupported extension type '{}'", ext.extension_type);
                    return self.reject(&mut framed, packet.msg_num, state).await;
                }

                other => {
                    return self.reject(&mut framed, other, state).await;
                }
            }
        }
    }

    /// Answer a protocol-sequence violation and terminate
    async fn reject<S>(
        &self,
        framed: &mut Framed<S, ControlCodec>,
        msg_num: MsgNum,
        state: SessionState,
    ) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let _ = framed
            .send(ControlPacket::empty(MsgNum::AgentFailure))
            .await;
        Err(AgentError::UnexpectedMessage(msg_num, state.name()))
    }
}
