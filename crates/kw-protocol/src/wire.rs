//! SSH wire-format primitives
//!
//! The session-layer messages use the SSH marshalling rules: `uint32` is
//! big-endian, `string` is a `uint32` length followed by that many bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Incremental reader over a wire-encoded buffer
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Wrap a payload for reading
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Read a `uint32`
    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        if self.buf.remaining() < 4 {
            return Err(ProtocolError::Truncated(field));
        }
        Ok(self.buf.get_u32())
    }

    /// Read a `string` as raw bytes
    pub fn read_bytes(&mut self, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_u32(field)? as usize;
        if self.buf.remaining() < len {
            return Err(ProtocolError::Truncated(field));
        }
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Read a `string` as UTF-8 text
    pub fn read_string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let bytes = self.read_bytes(field)?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    /// Fail if any bytes remain unread
    pub fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes(self.buf.remaining()));
        }
        Ok(())
    }
}

/// Builder for a wire-encoded payload
#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `uint32`
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Append a `string` from raw bytes
    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
        self
    }

    /// Append a `string` from text
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    /// Finish and return the encoded payload
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        let mut writer = WireWriter::new();
        writer.put_string("alice").put_u32(2222).put_string("");
        let encoded = writer.freeze();

        let mut reader = WireReader::new(&encoded);
        assert_eq!(reader.read_string("user").unwrap(), "alice");
        assert_eq!(reader.read_u32("port").unwrap(), 2222);
        assert_eq!(reader.read_string("empty").unwrap(), "");
        reader.finish().unwrap();
    }

    #[test]
    fn test_truncated_string() {
        // Length prefix says 10 bytes but only 3 follow
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.extend_from_slice(b"abc");

        let mut reader = WireReader::new(&buf);
        assert!(matches!(
            reader.read_string("name"),
            Err(ProtocolError::Truncated("name"))
        ));
    }

    #[test]
    fn test_truncated_u32() {
        let mut reader = WireReader::new(&[0u8, 1]);
        assert!(matches!(
            reader.read_u32("port"),
            Err(ProtocolError::Truncated("port"))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut writer = WireWriter::new();
        writer.put_u32(7).put_u32(9);
        let encoded = writer.freeze();

        let mut reader = WireReader::new(&encoded);
        reader.read_u32("first").unwrap();
        assert!(matches!(
            reader.finish(),
            Err(ProtocolError::TrailingBytes(4))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut writer = WireWriter::new();
        writer.put_bytes(&[0xFF, 0xFE]);
        let encoded = writer.freeze();

        let mut reader = WireReader::new(&encoded);
        assert!(matches!(
            reader.read_string("text"),
            Err(ProtocolError::InvalidUtf8("text"))
        ));
    }
}
