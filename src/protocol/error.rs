use thiserror::Error;

/// Schema and serialization failures for a single message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("No message contract registered for method '{0}'")]
    UnknownMethod(String),

    #[error("Message contract for method '{0}' is already registered")]
    DuplicateMethod(String),

    #[error("Missing required field '{field}' in {message}")]
    MissingField { message: String, field: String },

    #[error("{message} payload must be a JSON object")]
    NotAnObject { message: String },

    #[error("Malformed {message}: {reason}")]
    Malformed { message: String, reason: String },
}

impl ContractError {
    /// Name of the missing field, if this is a required-field violation.
    pub fn missing_field(&self) -> Option<&str> {
        match self {
            ContractError::MissingField { field, .. } => Some(field),
            _ => None,
        }
    }
}
