//! Incremental encoder and decoder for Fast message streams.
//!
//! The decoder accumulates raw bytes from the transport and yields complete
//! messages as soon as their frames are fully buffered. The owning read
//! loop applies inbound back-pressure simply by not reading while
//! downstream queues are full; the encoder side relies on the suspension of
//! async writes for outbound back-pressure.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::message::Message;

/// Encodes messages into wire frames.
pub struct MessageEncoder;

impl MessageEncoder {
    /// Encodes one message into a fresh buffer.
    pub fn encode(message: &Message) -> Result<BytesMut, ProtocolError> {
        message.encode()
    }

    /// Encodes one message, appending to `buf` so several messages can be
    /// flushed with a single write.
    pub fn encode_into(message: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        message.encode_into(buf)
    }
}

/// Decodes a byte stream into messages.
pub struct MessageDecoder {
    buffer: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends raw bytes from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes from the transport.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next complete message from the buffer.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        Message::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Called at end-of-stream: a partial frame left in the buffer means
    /// the peer truncated a message, which is a protocol error.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedFrame {
                buffered: self.buffer.len(),
            })
        }
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}
