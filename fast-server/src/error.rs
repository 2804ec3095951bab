//! Server error types.

use fast_protocol::{MessageStatus, ProtocolError};
use thiserror::Error;

/// Server errors.
///
/// `DuplicateRequestId` and `UnexpectedTerminator` are protocol violations
/// by the client and terminate the bearing connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("method already registered: {0}")]
    DuplicateMethod(String),

    #[error("request id {0} is already in flight on this connection")]
    DuplicateRequestId(u32),

    #[error("client sent a {0:?} message; only servers send terminators")]
    UnexpectedTerminator(MessageStatus),

    #[error("connection closed")]
    ConnectionClosed,
}
