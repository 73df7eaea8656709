//! Plugin log forwarding
//!
//! Plugins write diagnostics to the host with `Log` requests; the host
//! re-emits them through `tracing` under the plugin's name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::contract::{MessageContract, MessageSchema};
use super::methods;
use crate::connection::RequestHandler;
use crate::error::{IpcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Verbose,
    Information,
    Minimal,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRequest {
    pub log_level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogResponse {
    pub response_code: String,
}

pub struct Log;

impl MessageContract for Log {
    const METHOD: &'static str = methods::LOG;
    type Request = LogRequest;
    type Response = LogResponse;

    fn request_schema() -> MessageSchema {
        MessageSchema::new("LogRequest", &["logLevel", "message"])
    }

    fn response_schema() -> MessageSchema {
        MessageSchema::new("LogResponse", &["responseCode"])
    }
}

/// Re-emits plugin log requests as tracing events.
pub struct LogHandler {
    plugin: String,
}

impl LogHandler {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
        }
    }
}

#[async_trait]
impl RequestHandler for LogHandler {
    async fn handle(&self, payload: Option<Value>, _cancel: CancellationToken) -> Result<Value> {
        let request: LogRequest = serde_json::from_value(payload.unwrap_or(Value::Null))
            .map_err(|e| IpcError::ProtocolViolation(format!("invalid log request: {e}")))?;

        let plugin = self.plugin.as_str();
        match request.log_level {
            LogLevel::Debug | LogLevel::Verbose => {
                tracing::debug!(plugin = %plugin, "{}", request.message)
            }
            LogLevel::Information | LogLevel::Minimal => {
                tracing::info!(plugin = %plugin, "{}", request.message)
            }
            LogLevel::Warning => tracing::warn!(plugin = %plugin, "{}", request.message),
            LogLevel::Error => tracing::error!(plugin = %plugin, "{}", request.message),
        }

        Ok(json!({ "responseCode": "Success" }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_handler_acknowledges() {
        let handler = LogHandler::new("test-plugin");
        let response = handler
            .handle(
                Some(json!({"logLevel": "Warning", "message": "disk almost full"})),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response, json!({"responseCode": "Success"}));
    }

    #[tokio::test]
    async fn test_log_handler_rejects_unknown_level() {
        let handler = LogHandler::new("test-plugin");
        let result = handler
            .handle(
                Some(json!({"logLevel": "Loud", "message": "?"})),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(IpcError::ProtocolViolation(_))));
    }
}
