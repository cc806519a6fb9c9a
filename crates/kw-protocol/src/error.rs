//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol data
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown control message number
    #[error("Unknown message number: {0}")]
    UnknownMsgNum(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Wire data ended before a complete field was read
    #[error("Truncated {0} field")]
    Truncated(&'static str),

    /// A string field held invalid UTF-8
    #[error("Invalid UTF-8 in {0} field")]
    InvalidUtf8(&'static str),

    /// Extra bytes after the end of a message
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// Unknown multiplexer frame kind
    #[error("Unknown mux frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    /// Protobuf decode error
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
