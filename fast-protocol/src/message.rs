//! JSON message types for Fast RPC.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message status, encoded twice on the wire (type byte and status byte).
///
/// From clients, `Data` carries an RPC request. From servers, `Data` carries
/// a batch of emitted values, `End` completes a call successfully, and
/// `Error` completes it with a failure. Only servers send `End` and `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Data = 1,
    End = 2,
    Error = 3,
}

impl MessageStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageStatus::Data),
            2 => Some(MessageStatus::End),
            3 => Some(MessageStatus::Error),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns whether this status ends a response stream.
    pub fn is_terminator(self) -> bool {
        matches!(self, MessageStatus::End | MessageStatus::Error)
    }
}

/// Metadata carried in the `m` field of every message payload: the RPC
/// method name and a creation timestamp in microseconds since the Unix
/// epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub uts: u64,
    pub name: String,
}

impl Metadata {
    /// Creates metadata for the given method name, stamped with the current
    /// time.
    pub fn new(name: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            uts: now.as_micros() as u64,
            name: name.into(),
        }
    }
}

/// The JSON payload of a message: metadata plus the `d` field, which is an
/// array for DATA/END messages and an object for ERROR messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageData {
    pub m: Metadata,
    pub d: Value,
}

impl MessageData {
    pub fn new(name: impl Into<String>, d: Value) -> Self {
        Self {
            m: Metadata::new(name),
            d,
        }
    }
}

/// A decoded Fast message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message status (mirrored into the wire type byte).
    pub status: MessageStatus,
    /// Message id, non-zero, scoped to the connection.
    pub id: u32,
    /// The JSON payload.
    pub data: MessageData,
}

impl Message {
    /// A client-initiated RPC request: a DATA message whose `d` field is the
    /// argument array.
    pub fn request(id: u32, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            status: MessageStatus::Data,
            id,
            data: MessageData::new(method, Value::Array(args)),
        }
    }

    /// A DATA message with the given payload.
    pub fn data(id: u32, data: MessageData) -> Self {
        Self {
            status: MessageStatus::Data,
            id,
            data,
        }
    }

    /// A server DATA message emitting a batch of values.
    pub fn data_items(id: u32, method: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            status: MessageStatus::Data,
            id,
            data: MessageData::new(method, Value::Array(items)),
        }
    }

    /// An END message with an empty data array.
    pub fn end(id: u32, method: impl Into<String>) -> Self {
        Self {
            status: MessageStatus::End,
            id,
            data: MessageData::new(method, Value::Array(vec![])),
        }
    }

    /// An END message delivering one final value.
    pub fn end_with(id: u32, method: impl Into<String>, item: Value) -> Self {
        Self {
            status: MessageStatus::End,
            id,
            data: MessageData::new(method, Value::Array(vec![item])),
        }
    }

    /// An ERROR message carrying the given error payload.
    pub fn error(id: u32, method: impl Into<String>, err: &RpcError) -> Self {
        Self {
            status: MessageStatus::Error,
            id,
            data: MessageData::new(method, err.to_value()),
        }
    }

    /// For DATA/END messages, the emitted values. Empty for ERROR messages.
    pub fn items(&self) -> &[Value] {
        match self.data.d.as_array() {
            Some(items) => items,
            None => &[],
        }
    }
}

/// The error payload carried by ERROR messages.
///
/// `name`, `message`, and `info` are preserved across the wire; the
/// remaining fields are optional context that peers may attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RpcError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            info: None,
            context: None,
            ename: None,
            stack: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Serializes this error into the `d` object of an ERROR message.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("name".to_string(), Value::String(self.name.clone()));
        obj.insert("message".to_string(), Value::String(self.message.clone()));
        if let Some(info) = &self.info {
            obj.insert("info".to_string(), info.clone());
        }
        if let Some(context) = &self.context {
            obj.insert("context".to_string(), context.clone());
        }
        if let Some(ename) = &self.ename {
            obj.insert("ename".to_string(), Value::String(ename.clone()));
        }
        if let Some(stack) = &self.stack {
            obj.insert("stack".to_string(), Value::String(stack.clone()));
        }
        Value::Object(obj)
    }

    /// Decodes the `d` object of an ERROR message. Peers that send an
    /// object missing the required fields get a placeholder error rather
    /// than a protocol failure.
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| {
            RpcError::new("UnspecifiedError", "peer reported an unspecified error")
        })
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RpcError {}
