//! Stream multiplexer frame format
//!
//! After an execution request is approved, the stub↔agent connection is
//! promoted into a multiplexed session carrying the `control`, `ssh_data`
//! and `transport` streams. Frames use an 8-byte header:
//! - stream_id: 4 bytes (u32, big-endian)
//! - kind: 1 byte
//! - payload_length: 3 bytes (u24, big-endian)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the frame header in bytes
pub const MUX_HEADER_SIZE: usize = 8;

/// Maximum frame payload (limited by the 24-bit length field)
pub const MAX_MUX_PAYLOAD: usize = 0x00FF_FFFF;

/// Initial per-stream receive window in bytes
pub const INITIAL_WINDOW: u32 = 256 * 1024;

/// Frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxFrameKind {
    /// Open a new stream (initiator → acceptor, no payload)
    Open = 0x01,
    /// Stream data
    Data = 0x02,
    /// Grant additional send window (payload: u32 credit)
    WindowUpdate = 0x03,
    /// Half-close the sending side of a stream (no payload)
    Close = 0x04,
}

impl MuxFrameKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Open),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::WindowUpdate),
            0x04 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxHeader {
    /// Stream this frame belongs to
    pub stream_id: u32,
    /// Frame kind
    pub kind: MuxFrameKind,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl MuxHeader {
    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(MUX_HEADER_SIZE);
        dst.put_u32(self.stream_id);
        dst.put_u8(self.kind.as_u8());
        // payload_length: 3 bytes big-endian (24-bit)
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from a byte buffer.
    ///
    /// Returns None if there aren't enough bytes yet.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < MUX_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the kind byte before consuming anything
        let kind =
            MuxFrameKind::from_u8(src[4]).ok_or(ProtocolError::UnknownFrameKind(src[4]))?;

        let stream_id = src.get_u32();
        let _ = src.get_u8();
        let len_high = src.get_u8() as u32;
        let len_low = src.get_u16() as u32;

        Ok(Some(Self {
            stream_id,
            kind,
            payload_length: (len_high << 16) | len_low,
        }))
    }
}

/// A complete multiplexer frame
#[derive(Debug, Clone)]
pub struct MuxFrame {
    /// Stream this frame belongs to
    pub stream_id: u32,
    /// Frame kind
    pub kind: MuxFrameKind,
    /// Payload bytes
    pub payload: Bytes,
}

impl MuxFrame {
    /// A frame with no payload
    pub fn bare(stream_id: u32, kind: MuxFrameKind) -> Self {
        Self {
            stream_id,
            kind,
            payload: Bytes::new(),
        }
    }

    /// A data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind: MuxFrameKind::Data,
            payload,
        }
    }

    /// A window-update frame granting `credit` bytes
    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self {
            stream_id,
            kind: MuxFrameKind::WindowUpdate,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }

    /// Read the credit carried by a window-update frame
    pub fn credit(&self) -> Result<u32, ProtocolError> {
        if self.payload.len() != 4 {
            return Err(ProtocolError::Truncated("window credit"));
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.payload);
        Ok(u32::from_be_bytes(bytes))
    }
}

/// Codec for encoding/decoding multiplexer frames
#[derive(Debug, Default)]
pub struct MuxCodec {
    /// Header of a frame whose payload has not fully arrived yet
    pending: Option<MuxHeader>,
}

impl MuxCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { pending: None }
    }
}

impl Decoder for MuxCodec {
    type Item = MuxFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(h) => h,
            None => match MuxHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            self.pending = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        Ok(Some(MuxFrame {
            stream_id: header.stream_id,
            kind: header.kind,
            payload,
        }))
    }
}

impl Encoder<MuxFrame> for MuxCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: MuxFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();
        if payload_len > MAX_MUX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_MUX_PAYLOAD,
            });
        }

        MuxHeader {
            stream_id: frame.stream_id,
            kind: frame.kind,
            payload_length: payload_len as u32,
        }
        .encode(dst);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = MuxHeader {
            stream_id: 3,
            kind: MuxFrameKind::Data,
            payload_length: 0x012345,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), MUX_HEADER_SIZE);

        let decoded = MuxHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = MuxCodec::new();
        let frame = MuxFrame::data(5, Bytes::from_static(b"hello"));

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.stream_id, 5);
        assert_eq!(decoded.kind, MuxFrameKind::Data);
        assert_eq!(decoded.payload.as_ref(), b"hello");
    }

    #[test]
    fn test_window_update_credit() {
        let frame = MuxFrame::window_update(1, 65536);
        assert_eq!(frame.credit().unwrap(), 65536);

        let bad = MuxFrame::bare(1, MuxFrameKind::WindowUpdate);
        assert!(bad.credit().is_err());
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0xEE, 0, 0, 0][..]);
        assert!(matches!(
            MuxHeader::decode(&mut buf),
            Err(ProtocolError::UnknownFrameKind(0xEE))
        ));
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = MuxCodec::new();
        let frame = MuxFrame::data(1, Bytes::from_static(b"abcdef"));

        let mut full = BytesMut::new();
        codec.encode(frame, &mut full).unwrap();

        let mut partial = full.split_to(MUX_HEADER_SIZE + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), b"abcdef");
    }
}
