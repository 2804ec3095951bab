//! Client error types.

use fast_protocol::{ProtocolError, RpcError};
use thiserror::Error;

/// Client errors.
///
/// `Rpc` is request-scoped: the peer failed one call and the connection
/// survives. `ConnectionError` wraps a protocol violation and is fatal to
/// every request sharing the connection. The remaining variants are
/// lifecycle errors raised locally.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("client detached from transport")]
    Detached,

    #[error("request timed out")]
    Timeout,

    #[error("message id space exhausted")]
    IdSpaceExhausted,

    #[error("server error: {0}")]
    Rpc(#[from] RpcError),
}

impl ClientError {
    /// Returns the peer-reported error payload, if this is one.
    pub fn as_rpc_error(&self) -> Option<&RpcError> {
        match self {
            ClientError::Rpc(err) => Some(err),
            _ => None,
        }
    }
}
