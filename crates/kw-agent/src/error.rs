//! Agent error types

use thiserror::Error;

use kw_core::SignerError;
use kw_protocol::{MsgNum, ProtocolError};

use crate::mux::MuxError;

/// Errors terminating or degrading a stub connection
#[derive(Error, Debug)]
pub enum AgentError {
    /// Framing or marshalling failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The stub sent a message number outside the protocol
    #[error("Unrecognized incoming message: {0}")]
    UnknownMessage(u8),

    /// The stub sent a known message in the wrong state
    #[error("Unexpected {0:?} in state {1}")]
    UnexpectedMessage(MsgNum, &'static str),

    /// A credential challenge failed verification
    #[error("Request blocked due to invalid challenge: {0}")]
    BlockedChallenge(String),

    /// Credential signing failed
    #[error(transparent)]
    Signer(#[from] SignerError),

    /// Multiplexed session failure
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// I/O failure on the stub connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
