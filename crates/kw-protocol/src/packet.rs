//! Control packet framing
//!
//! Every message on the stub↔agent connection (and later on the `control`
//! stream) is carried as a control packet:
//! - msg_num: 1 byte
//! - payload_length: 4 bytes (u32, big-endian)
//! - payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the packet header in bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (1 MiB; credential blobs stay far below this)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Control message number
///
/// The low values are shared with the ssh-agent protocol; the 10x range
/// carries the guardian extensions. Values are a stable wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgNum {
    /// Generic failure reply
    AgentFailure = 5,
    /// Generic success reply
    AgentSuccess = 6,
    /// ssh-agent extension query
    AgentcExtension = 27,
    /// Request to run a command on a remote host
    ExecutionRequest = 101,
    /// The execution request was approved
    ExecutionApproved = 102,
    /// The execution request was denied
    ExecutionDenied = 103,
    /// Identity of the stub's host
    ForwardingNotice = 104,
    /// Request for a signed credential
    CredentialRequest = 105,
    /// Credential request outcome
    CredentialResponse = 106,
    /// Transport handoff succeeded
    HandoffComplete = 107,
    /// Transport handoff failed
    HandoffFailed = 108,
}

impl MsgNum {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            5 => Some(Self::AgentFailure),
            6 => Some(Self::AgentSuccess),
            27 => Some(Self::AgentcExtension),
            101 => Some(Self::ExecutionRequest),
            102 => Some(Self::ExecutionApproved),
            103 => Some(Self::ExecutionDenied),
            104 => Some(Self::ForwardingNotice),
            105 => Some(Self::CredentialRequest),
            106 => Some(Self::CredentialResponse),
            107 => Some(Self::HandoffComplete),
            108 => Some(Self::HandoffFailed),
            _ => None,
        }
    }
}

/// A complete control packet
#[derive(Debug, Clone)]
pub struct ControlPacket {
    /// Message number
    pub msg_num: MsgNum,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl ControlPacket {
    /// Create a new packet
    pub fn new(msg_num: MsgNum, payload: Bytes) -> Self {
        Self { msg_num, payload }
    }

    /// Create a packet with an empty payload
    pub fn empty(msg_num: MsgNum) -> Self {
        Self {
            msg_num,
            payload: Bytes::new(),
        }
    }
}

/// Codec for encoding/decoding control packets
#[derive(Debug, Default)]
pub struct ControlCodec {
    /// Header of a packet whose payload has not fully arrived yet
    pending: Option<(MsgNum, usize)>,
}

impl ControlCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { pending: None }
    }
}

impl Decoder for ControlCodec {
    type Item = ControlPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (msg_num, payload_len) = match self.pending.take() {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }

                // Validate the message number before consuming the header
                let msg_num = MsgNum::from_u8(src[0]).ok_or(ProtocolError::UnknownMsgNum(src[0]))?;

                // Validate the length before any allocation
                let payload_len =
                    u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
                if payload_len > MAX_PAYLOAD_SIZE {
                    return Err(ProtocolError::PayloadTooLarge {
                        size: payload_len,
                        max: MAX_PAYLOAD_SIZE,
                    });
                }

                src.advance(HEADER_SIZE);
                (msg_num, payload_len)
            }
        };

        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending = Some((msg_num, payload_len));
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        Ok(Some(ControlPacket { msg_num, payload }))
    }
}

impl Encoder<ControlPacket> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: ControlPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = packet.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + payload_len);
        dst.put_u8(packet.msg_num.as_u8());
        dst.put_u32(payload_len as u32);
        dst.extend_from_slice(&packet.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_num_roundtrip() {
        for msg_num in [
            MsgNum::AgentFailure,
            MsgNum::AgentSuccess,
            MsgNum::AgentcExtension,
            MsgNum::ExecutionRequest,
            MsgNum::ExecutionApproved,
            MsgNum::ExecutionDenied,
            MsgNum::ForwardingNotice,
            MsgNum::CredentialRequest,
            MsgNum::CredentialResponse,
            MsgNum::HandoffComplete,
            MsgNum::HandoffFailed,
        ] {
            assert_eq!(MsgNum::from_u8(msg_num.as_u8()), Some(msg_num));
        }
    }

    #[test]
    fn test_packet_roundtrip() {
        let mut codec = ControlCodec::new();
        let packet = ControlPacket::new(MsgNum::ExecutionRequest, Bytes::from_static(b"payload"));

        let mut buf = BytesMut::new();
        codec.encode(packet, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 7);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_num, MsgNum::ExecutionRequest);
        assert_eq!(decoded.payload.as_ref(), b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(ControlPacket::empty(MsgNum::AgentSuccess), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_num, MsgNum::AgentSuccess);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_partial_header() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from(&[101u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_partial_payload_resumes() {
        let mut codec = ControlCodec::new();
        let packet = ControlPacket::new(MsgNum::ExecutionDenied, Bytes::from_static(b"denied"));

        let mut full = BytesMut::new();
        codec.encode(packet, &mut full).unwrap();

        let mut partial = full.split_to(HEADER_SIZE + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), b"denied");
    }

    #[test]
    fn test_unknown_msg_num() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from(&[0xFEu8, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::UnknownMsgNum(0xFE))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(MsgNum::CredentialRequest.as_u8());
        buf.put_u32((MAX_PAYLOAD_SIZE + 1) as u32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
