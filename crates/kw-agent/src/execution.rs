//! Execution request handling
//!
//! Policy consult, command filter construction, promotion of the
//! connection into the three-stream multiplex, and the proxy run.

use std::sync::Arc;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use kw_core::Scope;
use kw_protocol::{ControlCodec, ControlPacket, ExecutionDenied, MsgNum};

use crate::agent::Agent;
use crate::error::AgentError;
use crate::mux::{MuxRole, MuxSession};
use crate::proxy::{CommandFilter, ProxySession};

impl Agent {
    /// Handle an approved-or-denied execution request. Consumes the
    /// connection: on approval it is promoted into a multiplexed session
    /// and handed to the SSH proxy.
    pub(crate) async fn handle_execution_request<S>(
        &self,
        mut framed: Framed<S, ControlCodec>,
        scope: Scope,
        command: String,
        port: u32,
    ) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(denial) = self.policy().request_approval(&scope, &command).await {
            info!("Execution denied for {}: {}", scope, denial);
            framed
                .send(
                    ExecutionDenied {
                        reason: denial.reason,
                    }
                    .into(),
                )
                .await?;
            // Refusal honored the user's intent; the connection ends cleanly
            return Ok(());
        }

        let filter = Arc::new(CommandFilter::new(
            command.clone(),
            scope.clone(),
            Arc::clone(self.policy()),
        ));

        framed
            .send(ControlPacket::empty(MsgNum::ExecutionApproved))
            .await?;

        // Promote the connection: any bytes already buffered by the codec
        // belong to the multiplexer now
        let parts = framed.into_parts();
        let mut mux = MuxSession::new(parts.io, MuxRole::Acceptor, parts.read_buf, 3);

        // Exactly three streams, in this order; anything else is fatal
        let control = mux.accept().await?;
        let ssh_data = mux.accept().await?;
        let transport = mux.accept().await?;
        debug!(
            "Accepted mux streams control={} ssh_data={} transport={}",
            control.id(),
            ssh_data.id(),
            transport.id()
        );

        let mut control = Framed::new(control, ControlCodec::new());

        let proxy = ProxySession {
            scope,
            port,
            filter,
            known_hosts: Arc::clone(self.known_hosts()),
            signers: self.signers().to_vec(),
            ui: self.ui(),
            connect_timeout: self.config().connect_timeout,
        };
        proxy.run(ssh_data, transport, &mut control).await?;

        // Dropping the control stream closes the last of the three
        drop(control);
        Ok(())
    }
}
