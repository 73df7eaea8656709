use std::time::Duration;
use thiserror::Error;

use crate::protocol::error::ContractError;

/// Errors surfaced by the plugin engine.
///
/// The type is `Clone` because a single plugin creation is shared by every
/// caller racing on the same identity, and each of them receives the outcome.
#[derive(Error, Debug, Clone)]
pub enum IpcError {
    #[error("Failed to launch plugin '{plugin}': {reason}")]
    Launch { plugin: String, reason: String },

    #[error("Handshake with plugin '{plugin}' timed out after {timeout:?}")]
    HandshakeTimeout { plugin: String, timeout: Duration },

    #[error("Handshake with plugin '{plugin}' failed: {reason}")]
    HandshakeFailed { plugin: String, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Request '{method}' timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    #[error("Request '{method}' was cancelled")]
    RequestCancelled { method: String },

    #[error("Plugin reported a fault for '{method}': {message}")]
    RemoteFault { method: String, message: String },

    #[error("Connection faulted: {0}")]
    ConnectionFault(String),

    #[error("Plugin handle for '{0}' is disposed")]
    Disposed(String),

    #[error("Acquiring plugin '{plugin}' was cancelled")]
    AcquireCancelled { plugin: String },

    #[error("Plugin registry is shut down")]
    RegistryClosed,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl IpcError {
    /// True for outcomes that belong to a single request and say nothing
    /// about the health of the connection.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            IpcError::RequestTimeout { .. }
                | IpcError::RequestCancelled { .. }
                | IpcError::RemoteFault { .. }
                | IpcError::Contract(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, IpcError>;
