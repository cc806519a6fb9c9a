//! Credential issuance
//!
//! A remote peer proves it is the host the agent expects for the stub's
//! endpoint by presenting candidate server public keys; the agent narrows
//! the challenge to the key it recognizes, consults policy, and returns a
//! signed credential binding the operation to that challenge. Exactly one
//! response is written per request, on every path.

use bytes::Bytes;
use futures::SinkExt;
use prost::Message;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{info, warn};

use kw_core::{Scope, SignerError};
use kw_protocol::{
    Challenge, ControlCodec, ControlPacket, Credential, CredentialRequest, CredentialResponse,
    MsgNum,
};

use crate::agent::Agent;
use crate::error::AgentError;

impl Agent {
    /// Verify, authorize, sign, respond. Denials and verification
    /// failures still produce a `CREDENTIAL_RESPONSE`; the returned error
    /// exists for logging and UI reporting only.
    pub(crate) async fn handle_credential_request<S>(
        &self,
        framed: &mut Framed<S, ControlCodec>,
        scope: &Scope,
        req: CredentialRequest,
    ) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut challenge = req.challenge.clone().unwrap_or_default();
        if let Err(reason) = self.check_challenge(scope, &mut challenge) {
            send_response(framed, CredentialResponse::denied()).await?;
            return Err(AgentError::BlockedChallenge(reason));
        }

        // Policy sees the narrowed challenge
        let narrowed = CredentialRequest {
            op: req.op.clone(),
            challenge: Some(challenge.clone()),
        };
        if self
            .policy()
            .request_credential_approval(scope, &narrowed)
            .await
            .is_err()
        {
            info!("Credential request from {} denied by policy", scope.client_name);
            // Refusal is a valid outcome, not an error
            return send_response(framed, CredentialResponse::denied()).await;
        }

        let mut credential = Credential {
            op: req.op,
            challenge: Some(challenge),
            ..Default::default()
        };
        match self.sign_credential(&mut credential) {
            Ok(()) => send_response(framed, CredentialResponse::approved(credential)).await,
            Err(e) => {
                warn!("Failed to sign credential: {}", e);
                send_response(framed, CredentialResponse::denied()).await?;
                Err(e.into())
            }
        }
    }

    /// Narrow the challenge to the single candidate key recorded in
    /// known_hosts for the client endpoint. First match wins.
    fn check_challenge(&self, scope: &Scope, challenge: &mut Challenge) -> Result<(), String> {
        for blob in &challenge.server_public_keys {
            if self
                .known_hosts()
                .contains_blob(&scope.client_hostname, scope.client_port, blob)
            {
                challenge.server_public_keys = vec![blob.clone()];
                return Ok(());
            }
        }
        Err(format!(
            "could not verify server public key for {} against known_hosts",
            scope.client_endpoint()
        ))
    }

    /// Attach a fresh nonce and the first signer's key, then sign the
    /// credential with its signature fields empty.
    fn sign_credential(&self, credential: &mut Credential) -> Result<(), SignerError> {
        let signer = self.signers().first().ok_or(SignerError::NoSigners)?;

        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        credential.signer_nonce = nonce.to_vec();
        credential.signature_key = signer.public_key_blob();

        let signature = signer.sign(&credential.signing_bytes())?;
        credential.signature = signature.blob;
        credential.signature_format = signature.format;
        Ok(())
    }
}

async fn send_response<S>(
    framed: &mut Framed<S, ControlCodec>,
    response: CredentialResponse,
) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = Bytes::from(response.encode_to_vec());
    framed
        .send(ControlPacket::new(MsgNum::CredentialResponse, payload))
        .await?;
    Ok(())
}
