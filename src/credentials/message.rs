//! `GetAuthenticationCredentials` request and response
//!
//! All three request fields are required on the wire. The response only
//! requires `isValid`; credentials and auth types are optional.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::protocol::{methods, MessageContract, MessageSchema};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAuthenticationCredentialsRequest {
    pub uri: Url,
    pub is_retry: bool,
    pub non_interactive: bool,
}

impl GetAuthenticationCredentialsRequest {
    pub fn new(uri: Url, is_retry: bool, non_interactive: bool) -> Self {
        Self {
            uri,
            is_retry,
            non_interactive,
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAuthenticationCredentialsResponse {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_types: Option<Vec<String>>,
}

impl std::fmt::Debug for GetAuthenticationCredentialsResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetAuthenticationCredentialsResponse")
            .field("is_valid", &self.is_valid)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("auth_types", &self.auth_types)
            .finish()
    }
}

pub struct GetAuthenticationCredentials;

impl MessageContract for GetAuthenticationCredentials {
    const METHOD: &'static str = methods::GET_AUTHENTICATION_CREDENTIALS;
    type Request = GetAuthenticationCredentialsRequest;
    type Response = GetAuthenticationCredentialsResponse;

    fn request_schema() -> MessageSchema {
        MessageSchema::new(
            "GetAuthenticationCredentialsRequest",
            &["uri", "isRetry", "nonInteractive"],
        )
    }

    fn response_schema() -> MessageSchema {
        MessageSchema::new("GetAuthenticationCredentialsResponse", &["isValid"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContractError, ContractRegistry, Direction};
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = GetAuthenticationCredentialsRequest::new(
            Url::parse("https://feed.example/v3/index.json").unwrap(),
            false,
            true,
        );

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "uri": "https://feed.example/v3/index.json",
                "isRetry": false,
                "nonInteractive": true
            })
        );
    }

    #[test]
    fn test_request_missing_non_interactive_rejected() {
        let registry = ContractRegistry::with_defaults();
        let err = registry
            .validate(
                GetAuthenticationCredentials::METHOD,
                Direction::Request,
                Some(&json!({"uri": "https://feed.example", "isRetry": false})),
            )
            .unwrap_err();

        assert_eq!(
            err,
            ContractError::MissingField {
                message: "GetAuthenticationCredentialsRequest".into(),
                field: "nonInteractive".into(),
            }
        );
    }

    #[test]
    fn test_response_optional_fields() {
        let registry = ContractRegistry::with_defaults();
        let response: GetAuthenticationCredentialsResponse = registry
            .decode(
                GetAuthenticationCredentials::METHOD,
                Direction::Response,
                Some(json!({"isValid": false})),
            )
            .unwrap();

        assert!(!response.is_valid);
        assert_eq!(response.username, None);
        assert_eq!(response.auth_types, None);
    }

    #[test]
    fn test_response_debug_redacts_password() {
        let response = GetAuthenticationCredentialsResponse {
            is_valid: true,
            username: Some("alice".into()),
            password: Some("hunter2".into()),
            auth_types: None,
        };
        let rendered = format!("{response:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }
}
