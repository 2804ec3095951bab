//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors raised while framing or decoding messages.
///
/// Every variant is fatal to the connection that produced it: the peer has
/// either violated the wire format or the stream has been corrupted, so no
/// further bytes from it can be trusted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid message type: {0:#x}")]
    InvalidMessageType(u8),

    #[error("message status {status:#x} does not match type {msg_type:#x}")]
    StatusMismatch { msg_type: u8, status: u8 },

    #[error("message id must be non-zero")]
    ZeroMessageId,

    #[error("reserved checksum bits set: {0:#x}")]
    ReservedCrcBits(u32),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("empty payload: expected a JSON object")]
    EmptyPayload,

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    PayloadNotObject,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("data field must be an array for DATA and END messages")]
    DataNotArray,

    #[error("data field must be an object for ERROR messages")]
    DataNotObject,

    #[error("truncated frame at end of stream: {buffered} bytes buffered")]
    TruncatedFrame { buffered: usize },
}
