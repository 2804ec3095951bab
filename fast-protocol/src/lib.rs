//! # fast-protocol
//!
//! Wire protocol implementation for Fast RPC.
//!
//! This crate provides:
//! - Binary framing with a fixed 15-byte header and CRC-16/XMODEM validation
//! - JSON message serialization/deserialization
//! - Message envelope types and the RPC error payload shape
//! - The per-connection message id allocator
//!
//! A Fast connection carries discrete messages in both directions. A client
//! initiates an RPC by sending a `DATA` message whose payload names the
//! method and carries the argument array; the server replies with any number
//! of `DATA` messages followed by exactly one `END` or `ERROR` message, all
//! bearing the client's message id.

pub mod codec;
pub mod error;
pub mod frame;
pub mod ids;
pub mod message;

pub use codec::{MessageDecoder, MessageEncoder};
pub use error::ProtocolError;
pub use frame::FRAME_HEADER_SIZE;
pub use ids::{MessageIdAllocator, MAX_MESSAGE_ID};
pub use message::{Message, MessageData, MessageStatus, Metadata, RpcError};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port for Fast servers.
pub const DEFAULT_PORT: u16 = 2030;

/// Maximum total frame size (16 MiB), header included.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum frame payload size: the frame cap less the fixed header.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;
