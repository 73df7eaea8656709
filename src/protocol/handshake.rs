//! Protocol version handshake
//!
//! The host opens every plugin connection with a `Handshake` request offering
//! its current and minimum protocol versions. A plugin may also handshake the
//! host, which is answered by [`HandshakeHandler`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::contract::{MessageContract, MessageSchema};
use super::methods;
use super::version::{ProtocolVersion, CURRENT_PROTOCOL_VERSION, MINIMUM_PROTOCOL_VERSION};
use crate::connection::{Connection, RequestHandler};
use crate::error::{IpcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeResponseCode {
    Success,
    Error,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub protocol_version: ProtocolVersion,
    pub minimum_protocol_version: ProtocolVersion,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            minimum_protocol_version: MINIMUM_PROTOCOL_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub response_code: HandshakeResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<ProtocolVersion>,
}

impl HandshakeResponse {
    /// Pick the version both sides can speak, or explain why there is none.
    pub fn negotiated_version(&self, offered: &HandshakeRequest) -> std::result::Result<ProtocolVersion, String> {
        match (self.response_code, self.protocol_version) {
            (HandshakeResponseCode::Success, Some(version))
                if version.is_within(
                    offered.minimum_protocol_version,
                    offered.protocol_version,
                ) =>
            {
                Ok(version)
            }
            (HandshakeResponseCode::Success, Some(version)) => Err(format!(
                "plugin protocol version {version} is outside [{}, {}]",
                offered.minimum_protocol_version, offered.protocol_version
            )),
            (HandshakeResponseCode::Success, None) => {
                Err("plugin accepted the handshake without a protocol version".to_string())
            }
            (code, _) => Err(format!("plugin rejected the handshake ({code:?})")),
        }
    }
}

pub struct Handshake;

impl MessageContract for Handshake {
    const METHOD: &'static str = methods::HANDSHAKE;
    type Request = HandshakeRequest;
    type Response = HandshakeResponse;

    fn request_schema() -> MessageSchema {
        MessageSchema::new(
            "HandshakeRequest",
            &["protocolVersion", "minimumProtocolVersion"],
        )
    }

    fn response_schema() -> MessageSchema {
        MessageSchema::new("HandshakeResponse", &["responseCode"])
    }
}

/// Run the host-initiated handshake on a freshly opened connection.
pub async fn perform(
    connection: &Connection,
    plugin: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProtocolVersion> {
    let offered = HandshakeRequest::default();

    let response = connection
        .send_request_with_timeout::<Handshake>(&offered, timeout, cancel)
        .await
        .map_err(|e| match e {
            IpcError::RequestTimeout { timeout, .. } => IpcError::HandshakeTimeout {
                plugin: plugin.to_string(),
                timeout,
            },
            IpcError::RequestCancelled { .. } => IpcError::AcquireCancelled {
                plugin: plugin.to_string(),
            },
            other
                if other.is_request_scoped()
                    || matches!(other, IpcError::ProtocolViolation(_)) =>
            {
                IpcError::HandshakeFailed {
                    plugin: plugin.to_string(),
                    reason: other.to_string(),
                }
            }
            other => other,
        })?;

    response
        .negotiated_version(&offered)
        .map_err(|reason| IpcError::HandshakeFailed {
            plugin: plugin.to_string(),
            reason,
        })
}

/// Answers handshakes initiated by the plugin.
pub struct HandshakeHandler;

#[async_trait]
impl RequestHandler for HandshakeHandler {
    async fn handle(&self, payload: Option<Value>, _cancel: CancellationToken) -> Result<Value> {
        let request: HandshakeRequest = serde_json::from_value(payload.unwrap_or(Value::Null))
            .map_err(|e| IpcError::ProtocolViolation(format!("invalid handshake request: {e}")))?;

        let response = if CURRENT_PROTOCOL_VERSION
            .is_within(request.minimum_protocol_version, request.protocol_version)
        {
            HandshakeResponse {
                response_code: HandshakeResponseCode::Success,
                protocol_version: Some(CURRENT_PROTOCOL_VERSION),
            }
        } else {
            HandshakeResponse {
                response_code: HandshakeResponseCode::Error,
                protocol_version: None,
            }
        };

        serde_json::to_value(response)
            .map_err(|e| IpcError::ProtocolViolation(format!("failed to encode handshake response: {e}")))
    }
}
