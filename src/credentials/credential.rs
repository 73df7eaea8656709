use serde::{Deserialize, Serialize};
use std::fmt;

use super::message::GetAuthenticationCredentialsResponse;

/// Username and password handed back by a plugin.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredential {
    pub username: String,
    pub password: String,
}

impl NetworkCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for NetworkCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A credential, optionally restricted to a set of authentication schemes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginCredential {
    pub credential: NetworkCredential,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_schemes: Option<Vec<String>>,
}

impl PluginCredential {
    /// The credential to present for `scheme` ("Basic", "Negotiate", ...),
    /// or `None` when the plugin restricted it to other schemes.
    pub fn credential_for(&self, scheme: &str) -> Option<&NetworkCredential> {
        match &self.allowed_schemes {
            None => Some(&self.credential),
            Some(schemes) => schemes
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(scheme))
                .then_some(&self.credential),
        }
    }
}

/// Why the host is asking for credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialRequestKind {
    Proxy,
    Unauthorized,
    Forbidden,
}

/// Result of one credential exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum CredentialOutcome {
    Success(PluginCredential),
    ProviderNotApplicable,
    Error(String),
}

impl CredentialOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CredentialOutcome::Success(_))
    }
}

impl From<GetAuthenticationCredentialsResponse> for CredentialOutcome {
    fn from(response: GetAuthenticationCredentialsResponse) -> Self {
        if !response.is_valid {
            return CredentialOutcome::ProviderNotApplicable;
        }

        CredentialOutcome::Success(PluginCredential {
            credential: NetworkCredential::new(
                response.username.unwrap_or_default(),
                response.password.unwrap_or_default(),
            ),
            allowed_schemes: response.auth_types,
        })
    }
}
