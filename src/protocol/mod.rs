//! Wire envelope and message contracts
//!
//! Every frame exchanged with a plugin is a single JSON envelope:
//!
//! ```json
//! { "type": "Request", "method": "Handshake", "correlationId": "…", "payload": {…} }
//! ```
//!
//! The envelope is transport-agnostic; framing is the channel's business.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod contract;
pub mod error;
pub mod handshake;
pub mod log;
pub mod version;

pub use contract::{ContractRegistry, Direction, MessageContract, MessageSchema};
pub use error::ContractError;
pub use version::ProtocolVersion;

/// Method identifiers known to the host.
pub mod methods {
    pub const HANDSHAKE: &str = "Handshake";
    pub const LOG: &str = "Log";
    pub const GET_AUTHENTICATION_CREDENTIALS: &str = "GetAuthenticationCredentials";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Response,
    Fault,
    Cancel,
    Progress,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub method: String,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Payload of a `Fault` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPayload {
    pub message: String,
}

/// Payload of a `Progress` envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

impl Envelope {
    pub fn request(method: impl Into<String>, correlation_id: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Request, method, correlation_id, Some(payload))
    }

    pub fn response(method: impl Into<String>, correlation_id: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Response, method, correlation_id, Some(payload))
    }

    pub fn fault(
        method: impl Into<String>,
        correlation_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let payload = serde_json::json!({ "message": message.into() });
        Self::new(MessageType::Fault, method, correlation_id, Some(payload))
    }

    pub fn cancel(method: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::new(MessageType::Cancel, method, correlation_id, None)
    }

    pub fn progress(
        method: impl Into<String>,
        correlation_id: impl Into<String>,
        percentage: Option<f64>,
    ) -> Self {
        let payload = serde_json::to_value(ProgressPayload { percentage }).ok();
        Self::new(MessageType::Progress, method, correlation_id, payload)
    }

    fn new(
        message_type: MessageType,
        method: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            message_type,
            method: method.into(),
            correlation_id: correlation_id.into(),
            payload,
        }
    }

    /// Serialize to a single frame.
    pub fn encode(&self) -> Result<Bytes, ContractError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ContractError::Malformed {
                message: "envelope".to_string(),
                reason: e.to_string(),
            })
    }

    /// Parse a frame, rejecting envelopes with empty identifying fields.
    pub fn decode(frame: &[u8]) -> Result<Self, ContractError> {
        let envelope: Envelope =
            serde_json::from_slice(frame).map_err(|e| ContractError::Malformed {
                message: "envelope".to_string(),
                reason: e.to_string(),
            })?;

        if envelope.method.is_empty() {
            return Err(ContractError::MissingField {
                message: "envelope".to_string(),
                field: "method".to_string(),
            });
        }
        if envelope.correlation_id.is_empty() {
            return Err(ContractError::MissingField {
                message: "envelope".to_string(),
                field: "correlationId".to_string(),
            });
        }

        Ok(envelope)
    }

    /// Fault text carried by a `Fault` envelope.
    pub fn fault_message(&self) -> String {
        self.payload
            .clone()
            .and_then(|payload| serde_json::from_value::<FaultPayload>(payload).ok())
            .map(|fault| fault.message)
            .unwrap_or_else(|| "plugin reported a fault without a message".to_string())
    }
}
