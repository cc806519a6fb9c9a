//! Session-layer messages
//!
//! These are the SSH-wire-marshalled payloads carried in control packets.
//! Credential requests and responses use protobuf instead (see
//! [`crate::credential`]).

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::packet::{ControlPacket, MsgNum};
use crate::wire::{WireReader, WireWriter};

/// Extension type the stub uses to probe for a guardian agent
pub const GUARD_EXTENSION_TYPE: &str = "guard@keywarden.dev";

/// Identity of the stub's host, sent before any request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingNotice {
    /// Human-readable label for the client machine
    pub readable_name: String,
    /// Hostname the agent should expect credential challenges for
    pub host: String,
    /// Port of the client's elevation helper
    pub port: u32,
}

/// Request to run a command on a remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Remote username
    pub user: String,
    /// Remote server, `host` or `host:port`
    pub server: String,
    /// The command to run
    pub command: String,
}

/// Denial of an execution request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionDenied {
    /// Why the request was denied
    pub reason: String,
}

/// Final control message of a successful proxy run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffComplete {
    /// Offset of the first transport byte the stub must consume itself
    pub next_transport_byte: u32,
}

/// Final control message of a failed proxy run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffFailed {
    /// Error description
    pub msg: String,
}

/// ssh-agent extension query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExtension {
    /// Extension type identifier
    pub extension_type: String,
    /// Extension-specific payload
    pub payload: Vec<u8>,
}

macro_rules! impl_into_packet {
    ($ty:ty, $msg_num:expr) => {
        impl From<$ty> for ControlPacket {
            fn from(msg: $ty) -> ControlPacket {
                ControlPacket::new($msg_num, msg.encode())
            }
        }
    };
}

impl ForwardingNotice {
    /// Encode to wire format
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_string(&self.readable_name)
            .put_string(&self.host)
            .put_u32(self.port);
        w.freeze()
    }

    /// Decode from wire format
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let notice = Self {
            readable_name: r.read_string("readable_name")?,
            host: r.read_string("host")?,
            port: r.read_u32("port")?,
        };
        r.finish()?;
        Ok(notice)
    }
}
impl_into_packet!(ForwardingNotice, MsgNum::ForwardingNotice);

impl ExecutionRequest {
    /// Encode to wire format
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_string(&self.user)
            .put_string(&self.server)
            .put_string(&self.command);
        w.freeze()
    }

    /// Decode from wire format
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let req = Self {
            user: r.read_string("user")?,
            server: r.read_string("server")?,
            command: r.read_string("command")?,
        };
        r.finish()?;
        Ok(req)
    }
}
impl_into_packet!(ExecutionRequest, MsgNum::ExecutionRequest);

impl ExecutionDenied {
    /// Encode to wire format
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_string(&self.reason);
        w.freeze()
    }

    /// Decode from wire format
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let denied = Self {
            reason: r.read_string("reason")?,
        };
        r.finish()?;
        Ok(denied)
    }
}
impl_into_packet!(ExecutionDenied, MsgNum::ExecutionDenied);

impl HandoffComplete {
    /// Encode to wire format
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_u32(self.next_transport_byte);
        w.freeze()
    }

    /// Decode from wire format
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            next_transport_byte: r.read_u32("next_transport_byte")?,
        };
        r.finish()?;
        Ok(msg)
    }
}
impl_into_packet!(HandoffComplete, MsgNum::HandoffComplete);

impl HandoffFailed {
    /// Encode to wire format
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_string(&self.msg);
        w.freeze()
    }

    /// Decode from wire format
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let msg = Self {
            msg: r.read_string("msg")?,
        };
        r.finish()?;
        Ok(msg)
    }
}
impl_into_packet!(HandoffFailed, MsgNum::HandoffFailed);

impl AgentExtension {
    /// Encode to wire format
    pub fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        w.put_string(&self.extension_type).put_bytes(&self.payload);
        w.freeze()
    }

    /// Decode from wire format
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(payload);
        let ext = Self {
            extension_type: r.read_string("extension_type")?,
            payload: r.read_bytes("payload")?,
        };
        r.finish()?;
        Ok(ext)
    }
}
impl_into_packet!(AgentExtension, MsgNum::AgentcExtension);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_notice_roundtrip() {
        let notice = ForwardingNotice {
            readable_name: "laptop".to_string(),
            host: "10.0.0.2".to_string(),
            port: 2222,
        };
        let decoded = ForwardingNotice::decode(&notice.encode()).unwrap();
        assert_eq!(decoded, notice);
    }

    #[test]
    fn test_execution_request_roundtrip() {
        let req = ExecutionRequest {
            user: "alice".to_string(),
            server: "srv.example".to_string(),
            command: "uptime".to_string(),
        };
        let decoded = ExecutionRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_handoff_complete_roundtrip() {
        let msg = HandoffComplete {
            next_transport_byte: 4242,
        };
        let decoded = HandoffComplete::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.next_transport_byte, 4242);
    }

    #[test]
    fn test_extension_roundtrip() {
        let ext = AgentExtension {
            extension_type: GUARD_EXTENSION_TYPE.to_string(),
            payload: vec![1, 2, 3],
        };
        let decoded = AgentExtension::decode(&ext.encode()).unwrap();
        assert_eq!(decoded, ext);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let req = ExecutionRequest {
            user: "alice".to_string(),
            server: "srv".to_string(),
            command: "ls".to_string(),
        };
        let encoded = req.encode();
        let result = ExecutionRequest::decode(&encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::Truncated(_))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let denied = ExecutionDenied {
            reason: "no".to_string(),
        };
        let mut encoded = denied.encode().to_vec();
        encoded.push(0);
        assert!(matches!(
            ExecutionDenied::decode(&encoded),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_packet_conversion_carries_msg_num() {
        let packet: ControlPacket = ForwardingNotice {
            readable_name: "laptop".to_string(),
            host: "10.0.0.2".to_string(),
            port: 22,
        }
        .into();
        assert_eq!(packet.msg_num, MsgNum::ForwardingNotice);
    }
}
