//! JSON wire envelope exchanged with connected clients.
//!
//! Wire format:
//! ```text
//! { "type": "<string>", "payload": <arbitrary JSON> }
//! ```
//!
//! The type set is open: anything not listed in [`MessageType`] decodes to
//! [`MessageType::Other`] and is handed to the router's fallback.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Encoded bytes queued for delivery, shared across every recipient.
pub type Payload = Arc<Vec<u8>>;

/// Envelope `type` values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Chat message delivery
    Message,
    /// Typing indicator
    Typing,
    /// Online/offline presence change
    OnlineStatus,
    /// Message read acknowledgement
    ReadReceipt,
    /// CRDT block update
    DocUpdate,
    /// Document edit lock
    DocLock,
    /// Generic notification
    Notification,
    /// Open a collaborative document session
    DocJoin,
    /// Close a collaborative document session
    DocLeave,
    /// Full document state sent to a joiner
    DocState,
    /// CRDT block tombstone
    DocDelete,
    /// Any other type, kept verbatim
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Message => "message",
            MessageType::Typing => "typing",
            MessageType::OnlineStatus => "online_status",
            MessageType::ReadReceipt => "read_receipt",
            MessageType::DocUpdate => "doc_update",
            MessageType::DocLock => "doc_lock",
            MessageType::Notification => "notification",
            MessageType::DocJoin => "doc_join",
            MessageType::DocLeave => "doc_leave",
            MessageType::DocState => "doc_state",
            MessageType::DocDelete => "doc_delete",
            MessageType::Other(name) => name,
        }
    }
}

impl From<&str> for MessageType {
    fn from(name: &str) -> Self {
        match name {
            "message" => MessageType::Message,
            "typing" => MessageType::Typing,
            "online_status" => MessageType::OnlineStatus,
            "read_receipt" => MessageType::ReadReceipt,
            "doc_update" => MessageType::DocUpdate,
            "doc_lock" => MessageType::DocLock,
            "notification" => MessageType::Notification,
            "doc_join" => MessageType::DocJoin,
            "doc_leave" => MessageType::DocLeave,
            "doc_state" => MessageType::DocState,
            "doc_delete" => MessageType::DocDelete,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        MessageType::from(name.as_str())
    }
}

impl From<MessageType> for String {
    fn from(msg_type: MessageType) -> Self {
        msg_type.as_str().to_string()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(msg_type: MessageType, payload: serde_json::Value) -> Self {
        Self { msg_type, payload }
    }

    /// Build an envelope around any serializable payload.
    pub fn with_payload<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self { msg_type, payload })
    }

    /// Serialize to JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Serialize into a shareable delivery payload.
    pub fn to_payload(&self) -> Result<Payload, ProtocolError> {
        self.encode().map(Arc::new)
    }

    /// Parse a client frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Interpret the payload as a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|e| ProtocolError::InvalidPayload {
            msg_type: self.msg_type.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid {msg_type} payload: {reason}")]
    InvalidPayload { msg_type: String, reason: String },
}
