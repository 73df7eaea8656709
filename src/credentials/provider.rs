use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::credential::{CredentialOutcome, CredentialRequestKind};
use super::message::{GetAuthenticationCredentials, GetAuthenticationCredentialsRequest};
use crate::plugin::{DiscoveryResult, PluginRegistry};

/// Something the host can ask for credentials for a package source.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn get_credentials(
        &self,
        uri: &Url,
        kind: CredentialRequestKind,
        is_retry: bool,
        non_interactive: bool,
        cancel: &CancellationToken,
    ) -> CredentialOutcome;
}

/// Obtains credentials from one credential-provider plugin.
pub struct PluginCredentialProvider {
    id: String,
    plugin: DiscoveryResult,
    registry: PluginRegistry,
    dispose_after_exchange: bool,
}

impl PluginCredentialProvider {
    pub fn new(plugin: DiscoveryResult, registry: PluginRegistry) -> Self {
        Self {
            id: format!("PluginCredentialProvider_{}", plugin.path().display()),
            plugin,
            registry,
            dispose_after_exchange: true,
        }
    }

    /// Keep the plugin running between exchanges instead of disposing it
    /// after each one.
    pub fn with_dispose_after_exchange(mut self, dispose: bool) -> Self {
        self.dispose_after_exchange = dispose;
        self
    }

    pub fn plugin(&self) -> &DiscoveryResult {
        &self.plugin
    }
}

#[async_trait]
impl CredentialProvider for PluginCredentialProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_credentials(
        &self,
        uri: &Url,
        kind: CredentialRequestKind,
        is_retry: bool,
        non_interactive: bool,
        cancel: &CancellationToken,
    ) -> CredentialOutcome {
        if kind == CredentialRequestKind::Proxy {
            debug!(provider = %self.id, "Proxy credentials are not served by plugins");
            return CredentialOutcome::ProviderNotApplicable;
        }

        let lease = match self.registry.acquire(&self.plugin, cancel).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(provider = %self.id, error = %e, "Failed to acquire credential plugin");
                return CredentialOutcome::Error(e.to_string());
            }
        };

        let request = GetAuthenticationCredentialsRequest::new(uri.clone(), is_retry, non_interactive);
        let result = lease
            .send_request::<GetAuthenticationCredentials>(&request, cancel)
            .await;

        if self.dispose_after_exchange {
            self.registry.release_and_dispose(lease).await;
        } else {
            self.registry.release(lease).await;
        }

        match result {
            Ok(response) => {
                debug!(
                    provider = %self.id,
                    uri = %uri,
                    is_valid = response.is_valid,
                    "Credential exchange completed"
                );
                CredentialOutcome::from(response)
            }
            Err(e) => {
                warn!(provider = %self.id, uri = %uri, error = %e, "Credential exchange failed");
                CredentialOutcome::Error(e.to_string())
            }
        }
    }
}
