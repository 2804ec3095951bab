//! Binary frame format for Fast messages.
//!
//! Frame layout (15-byte header + payload, all integers big-endian):
//!
//! ```text
//! +---------+------+--------+------------+-------+-------------+---------+
//! | version | type | status | message id | crc16 | payload_len | payload |
//! | 1 byte  |1 byte| 1 byte |  4 bytes   |4 bytes|   4 bytes   | N bytes |
//! +---------+------+--------+------------+-------+-------------+---------+
//! ```
//!
//! The type and status bytes carry the same value; a frame where they
//! diverge is rejected. The crc16 field holds the CRC-16/XMODEM of the
//! payload octets in its low 16 bits, with the upper 16 bits zero. The
//! payload is a UTF-8 JSON object.

use bytes::{Buf, BufMut, BytesMut};
use crc16::{State, XMODEM};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::message::{Message, MessageData, MessageStatus};
use crate::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

/// Size of the fixed frame header in bytes (1+1+1+4+4+4 = 15).
pub const FRAME_HEADER_SIZE: usize = 15;

const OFF_VERSION: usize = 0;
const OFF_TYPE: usize = 1;
const OFF_STATUS: usize = 2;
const OFF_MSGID: usize = 3;
const OFF_CRC: usize = 7;
const OFF_DATA_LEN: usize = 11;

impl Message {
    /// Encodes this message into a fresh buffer.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Encodes this message, appending to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.id == 0 {
            return Err(ProtocolError::ZeroMessageId);
        }

        let payload = serde_json::to_vec(&self.data)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: FRAME_HEADER_SIZE + payload.len(),
                max: crate::MAX_FRAME_SIZE,
            });
        }

        let crc = State::<XMODEM>::calculate(&payload);

        buf.reserve(FRAME_HEADER_SIZE + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.status.as_u8());
        buf.put_u8(self.status.as_u8());
        buf.put_u32(self.id);
        buf.put_u32(u32::from(crc));
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(())
    }

    /// Decodes a message from the front of `buf`.
    ///
    /// Returns `Ok(Some(message))` if a complete frame was decoded (the
    /// frame's bytes are consumed), `Ok(None)` if more data is needed, or
    /// `Err` on protocol errors. Oversized frames are rejected from the
    /// header alone, before any payload has been buffered.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming.
        let version = buf[OFF_VERSION];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let type_byte = buf[OFF_TYPE];
        let status_byte = buf[OFF_STATUS];
        let status = MessageStatus::from_u8(type_byte)
            .ok_or(ProtocolError::InvalidMessageType(type_byte))?;
        if status_byte != type_byte {
            return Err(ProtocolError::StatusMismatch {
                msg_type: type_byte,
                status: status_byte,
            });
        }

        let id = u32::from_be_bytes([
            buf[OFF_MSGID],
            buf[OFF_MSGID + 1],
            buf[OFF_MSGID + 2],
            buf[OFF_MSGID + 3],
        ]);
        if id == 0 {
            return Err(ProtocolError::ZeroMessageId);
        }

        let crc_field = u32::from_be_bytes([
            buf[OFF_CRC],
            buf[OFF_CRC + 1],
            buf[OFF_CRC + 2],
            buf[OFF_CRC + 3],
        ]);
        if crc_field > u32::from(u16::MAX) {
            return Err(ProtocolError::ReservedCrcBits(crc_field));
        }
        let expected_crc = crc_field as u16;

        let payload_len = u32::from_be_bytes([
            buf[OFF_DATA_LEN],
            buf[OFF_DATA_LEN + 1],
            buf[OFF_DATA_LEN + 2],
            buf[OFF_DATA_LEN + 3],
        ]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: FRAME_HEADER_SIZE + payload_len,
                max: crate::MAX_FRAME_SIZE,
            });
        }
        if payload_len == 0 {
            return Err(ProtocolError::EmptyPayload);
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let actual_crc = State::<XMODEM>::calculate(&payload);
        if actual_crc != expected_crc {
            return Err(ProtocolError::CrcMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        let text = std::str::from_utf8(&payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        let value: Value = serde_json::from_str(text)?;
        validate_payload(status, &value)?;
        let data: MessageData = serde_json::from_value(value)?;

        Ok(Some(Message { status, id, data }))
    }
}

/// Checks that a parsed payload structurally matches the message status.
fn validate_payload(status: MessageStatus, value: &Value) -> Result<(), ProtocolError> {
    let obj = value.as_object().ok_or(ProtocolError::PayloadNotObject)?;
    if !obj.contains_key("m") {
        return Err(ProtocolError::MissingField("m"));
    }
    let d = obj.get("d").ok_or(ProtocolError::MissingField("d"))?;
    match status {
        MessageStatus::Data | MessageStatus::End => {
            if !d.is_array() {
                return Err(ProtocolError::DataNotArray);
            }
        }
        MessageStatus::Error => {
            if !d.is_object() {
                return Err(ProtocolError::DataNotObject);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Metadata, RpcError};
    use quickcheck::{quickcheck, Arbitrary, Gen};
    use serde_json::json;

    fn sample_message() -> Message {
        Message::request(42, "echo", vec![json!("hello"), json!({"k": "v"})])
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = sample_message();
        let mut buf = msg.encode().unwrap();
        let decoded = Message::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reencode_reproduces_bytes() {
        let msg = sample_message();
        let encoded = msg.encode().unwrap();
        let mut buf = encoded.clone();
        let decoded = Message::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn test_incomplete_header() {
        let msg = sample_message();
        let encoded = msg.encode().unwrap();
        let mut buf = BytesMut::from(&encoded[..FRAME_HEADER_SIZE - 1]);
        assert!(Message::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_incomplete_payload() {
        let msg = sample_message();
        let encoded = msg.encode().unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Message::decode(&mut buf).unwrap().is_none());
        // The partial frame must not have been consumed.
        assert_eq!(buf.len(), encoded.len() - 1);
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = sample_message().encode().unwrap();
        buf[0] = 2;
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_invalid_message_type() {
        let mut buf = sample_message().encode().unwrap();
        buf[1] = 9;
        buf[2] = 9;
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::InvalidMessageType(9))
        ));
    }

    #[test]
    fn test_status_mismatch_rejected() {
        let mut buf = sample_message().encode().unwrap();
        buf[2] = MessageStatus::End.as_u8();
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::StatusMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_message_id_rejected() {
        let mut buf = sample_message().encode().unwrap();
        buf[3..7].copy_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::ZeroMessageId)
        ));
    }

    #[test]
    fn test_reserved_crc_bits_rejected() {
        let mut buf = sample_message().encode().unwrap();
        buf[7] = 0x01;
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::ReservedCrcBits(_))
        ));
    }

    #[test]
    fn test_crc_mismatch_on_corrupted_payload() {
        let mut buf = sample_message().encode().unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_from_header() {
        let mut buf = sample_message().encode().unwrap();
        // Declare a payload just over the cap; no payload bytes follow.
        let declared = (MAX_PAYLOAD_SIZE + 1) as u32;
        buf[11..15].copy_from_slice(&declared.to_be_bytes());
        buf.truncate(FRAME_HEADER_SIZE);
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_zero_length_payload_rejected() {
        let mut buf = sample_message().encode().unwrap();
        buf[11..15].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::EmptyPayload)
        ));
    }

    #[test]
    fn test_error_payload_must_be_object() {
        // An ERROR frame whose d field is an array.
        let bogus = Message {
            status: MessageStatus::Error,
            id: 5,
            data: MessageData::new("echo", json!([])),
        };
        let mut buf = bogus.encode().unwrap();
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::DataNotObject)
        ));
    }

    #[test]
    fn test_data_payload_must_be_array() {
        let bogus = Message {
            status: MessageStatus::Data,
            id: 5,
            data: MessageData::new("echo", json!({})),
        };
        let mut buf = bogus.encode().unwrap();
        assert!(matches!(
            Message::decode(&mut buf),
            Err(ProtocolError::DataNotArray)
        ));
    }

    #[test]
    fn test_error_message_roundtrip() {
        let err = RpcError::new("VError", "count out of range")
            .with_info(json!({"foundValue": 0, "minValue": 1, "maxValue": 10240}));
        let msg = Message::error(9, "yes", &err);
        let mut buf = msg.encode().unwrap();
        let decoded = Message::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.status, MessageStatus::Error);
        assert_eq!(RpcError::from_value(&decoded.data.d), err);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let first = Message::request(1, "echo", vec![json!("a")]);
        let second = Message::request(2, "echo", vec![json!("b")]);
        let mut buf = first.encode().unwrap();
        second.encode_into(&mut buf).unwrap();

        assert_eq!(Message::decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(Message::decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_at_any_boundary() {
        let first = Message::request(1, "echo", vec![json!("one")]);
        let second = Message::end_with(1, "echo", json!("two"));
        let mut bytes = first.encode().unwrap();
        second.encode_into(&mut bytes).unwrap();

        for split in 0..=bytes.len() {
            let mut buf = BytesMut::from(&bytes[..split]);
            let mut decoded = Vec::new();
            while let Some(msg) = Message::decode(&mut buf).unwrap() {
                decoded.push(msg);
            }
            buf.extend_from_slice(&bytes[split..]);
            while let Some(msg) = Message::decode(&mut buf).unwrap() {
                decoded.push(msg);
            }
            assert_eq!(decoded, vec![first.clone(), second.clone()]);
        }
    }

    impl Arbitrary for MessageStatus {
        fn arbitrary(g: &mut Gen) -> Self {
            *g.choose(&[
                MessageStatus::Data,
                MessageStatus::End,
                MessageStatus::Error,
            ])
            .unwrap()
        }
    }

    impl Arbitrary for Message {
        fn arbitrary(g: &mut Gen) -> Self {
            let status = MessageStatus::arbitrary(g);
            let id = (u32::arbitrary(g) % crate::MAX_MESSAGE_ID) + 1;
            let m = Metadata {
                uts: u64::arbitrary(g),
                name: String::arbitrary(g),
            };
            let d = match status {
                MessageStatus::Data | MessageStatus::End => {
                    let items: Vec<Value> = (0..usize::arbitrary(g) % 4)
                        .map(|_| json!({"value": String::arbitrary(g)}))
                        .collect();
                    Value::Array(items)
                }
                MessageStatus::Error => RpcError::new(String::arbitrary(g), String::arbitrary(g))
                    .with_info(json!({"detail": u64::arbitrary(g)}))
                    .to_value(),
            };
            Message {
                status,
                id,
                data: MessageData { m, d },
            }
        }
    }

    quickcheck! {
        fn prop_message_roundtrip(msg: Message) -> bool {
            let mut buf = match msg.encode() {
                Ok(buf) => buf,
                Err(_) => return false,
            };
            match Message::decode(&mut buf) {
                Ok(Some(decoded)) => decoded == msg && buf.is_empty(),
                _ => false,
            }
        }
    }

    quickcheck! {
        fn prop_message_bundling(msg: Message, count: u8) -> bool {
            let count = (count % 8) as usize + 1;
            let mut buf = BytesMut::new();
            for _ in 0..count {
                if msg.encode_into(&mut buf).is_err() {
                    return false;
                }
            }
            for _ in 0..count {
                match Message::decode(&mut buf) {
                    Ok(Some(decoded)) if decoded == msg => {}
                    _ => return false,
                }
            }
            buf.is_empty()
        }
    }
}
