//! Credential exchange with credential-provider plugins
//!
//! The host sends `GetAuthenticationCredentials` for a package source URI and
//! turns the plugin's answer into a [`CredentialOutcome`]. A plugin declining
//! the request is an outcome, not an error.

pub mod credential;
pub mod message;
pub mod provider;

pub use credential::{CredentialOutcome, CredentialRequestKind, NetworkCredential, PluginCredential};
pub use message::{
    GetAuthenticationCredentials, GetAuthenticationCredentialsRequest,
    GetAuthenticationCredentialsResponse,
};
pub use provider::{CredentialProvider, PluginCredentialProvider};
