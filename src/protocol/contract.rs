//! Message contracts and required-field validation
//!
//! Every method the engine can carry is described by a pair of schemas, one
//! for the request payload and one for the response payload. The connection
//! never looks at method names itself: it asks the registry to encode, decode,
//! and validate payloads, so adding a message type means registering a
//! contract and nothing else.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub use super::error::ContractError;

/// Which half of a contract a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => f.write_str("request"),
            Direction::Response => f.write_str("response"),
        }
    }
}

/// Required-field schema for one payload shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSchema {
    name: &'static str,
    required: &'static [&'static str],
}

impl MessageSchema {
    pub const fn new(name: &'static str, required: &'static [&'static str]) -> Self {
        Self { name, required }
    }

    /// Schema for payloads that carry nothing the engine must check.
    pub const fn empty(name: &'static str) -> Self {
        Self { name, required: &[] }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        self.required
    }

    /// Check that every required field is present and not `null`.
    ///
    /// An absent payload is treated as an empty object.
    pub fn validate(&self, payload: Option<&Value>) -> Result<(), ContractError> {
        let object = match payload {
            None | Some(Value::Null) => {
                return match self.required.first() {
                    Some(field) => Err(self.missing(field)),
                    None => Ok(()),
                };
            }
            Some(Value::Object(object)) => object,
            Some(_) => {
                return Err(ContractError::NotAnObject {
                    message: self.name.to_string(),
                })
            }
        };

        for field in self.required {
            match object.get(*field) {
                None | Some(Value::Null) => return Err(self.missing(field)),
                Some(_) => {}
            }
        }

        Ok(())
    }

    fn missing(&self, field: &str) -> ContractError {
        ContractError::MissingField {
            message: self.name.to_string(),
            field: field.to_string(),
        }
    }
}

/// A typed request/response pair bound to a method identifier.
pub trait MessageContract: Send + Sync + 'static {
    /// Method identifier carried in the envelope.
    const METHOD: &'static str;

    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn request_schema() -> MessageSchema;
    fn response_schema() -> MessageSchema;
}

#[derive(Debug, Clone)]
struct ContractEntry {
    request: MessageSchema,
    response: MessageSchema,
}

impl ContractEntry {
    fn schema(&self, direction: Direction) -> &MessageSchema {
        match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        }
    }
}

/// Method identifier -> (request schema, response schema).
///
/// Built once at host startup and shared read-only by every connection.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, ContractEntry>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the contracts the host itself speaks: the handshake,
    /// plugin log forwarding, and the credential exchange.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        // Fresh registry, no duplicates possible.
        let _ = registry.register_contract::<super::handshake::Handshake>();
        let _ = registry.register_contract::<super::log::Log>();
        let _ = registry
            .register_contract::<crate::credentials::message::GetAuthenticationCredentials>();
        registry
    }

    pub fn register(
        &mut self,
        method: &str,
        request: MessageSchema,
        response: MessageSchema,
    ) -> Result<(), ContractError> {
        if self.contracts.contains_key(method) {
            return Err(ContractError::DuplicateMethod(method.to_string()));
        }
        self.contracts
            .insert(method.to_string(), ContractEntry { request, response });
        Ok(())
    }

    pub fn register_contract<C: MessageContract>(&mut self) -> Result<(), ContractError> {
        self.register(C::METHOD, C::request_schema(), C::response_schema())
    }

    pub fn contains(&self, method: &str) -> bool {
        self.contracts.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }

    pub fn schema(&self, method: &str, direction: Direction) -> Result<&MessageSchema, ContractError> {
        self.contracts
            .get(method)
            .map(|entry| entry.schema(direction))
            .ok_or_else(|| ContractError::UnknownMethod(method.to_string()))
    }

    pub fn validate(
        &self,
        method: &str,
        direction: Direction,
        payload: Option<&Value>,
    ) -> Result<(), ContractError> {
        self.schema(method, direction)?.validate(payload)
    }

    /// Serialize a typed payload and validate the result.
    pub fn encode<T: Serialize>(
        &self,
        method: &str,
        direction: Direction,
        value: &T,
    ) -> Result<Value, ContractError> {
        let schema = self.schema(method, direction)?;
        let payload = serde_json::to_value(value).map_err(|e| ContractError::Malformed {
            message: schema.name().to_string(),
            reason: e.to_string(),
        })?;
        schema.validate(Some(&payload))?;
        Ok(payload)
    }

    /// Validate a raw payload and deserialize it into its typed form.
    pub fn decode<T: DeserializeOwned>(
        &self,
        method: &str,
        direction: Direction,
        payload: Option<Value>,
    ) -> Result<T, ContractError> {
        let schema = self.schema(method, direction)?;
        schema.validate(payload.as_ref())?;
        serde_json::from_value(payload.unwrap_or(Value::Null)).map_err(|e| {
            ContractError::Malformed {
                message: schema.name().to_string(),
                reason: e.to_string(),
            }
        })
    }
}
