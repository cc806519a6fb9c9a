//! kw-protocol: Wire protocol for the Keywarden guardian agent
//!
//! This crate defines the binary protocols spoken between the untrusted
//! stub and the agent: the length-prefixed control packet framing, the
//! SSH wire-format session messages, the protobuf credential types, and
//! the frame format of the stream multiplexer used after an execution
//! request has been approved.

pub mod credential;
pub mod error;
pub mod message;
pub mod mux;
pub mod packet;
pub mod wire;

pub use credential::{Challenge, Credential, CredentialRequest, CredentialResponse, CredentialStatus};
pub use error::ProtocolError;
pub use message::{
    AgentExtension, ExecutionDenied, ExecutionRequest, ForwardingNotice, HandoffComplete,
    HandoffFailed, GUARD_EXTENSION_TYPE,
};
pub use mux::{MuxCodec, MuxFrame, MuxFrameKind, MuxHeader, MUX_HEADER_SIZE};
pub use packet::{ControlCodec, ControlPacket, MsgNum, MAX_PAYLOAD_SIZE};
