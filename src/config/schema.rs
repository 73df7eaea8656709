use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::ConnectionOptions;
use crate::plugin::{RegistryOptions, ReleasePolicy};
use crate::transport::StdioLauncher;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    #[serde(default = "default_request_timeout")]
    pub request_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_ms: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default = "default_max_protocol_violations")]
    pub max_protocol_violations: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default)]
    pub release_policy: ReleasePolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherConfig {
    #[serde(default = "default_launcher_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsConfig {
    /// Dispose the plugin after every credential exchange.
    #[serde(default = "default_dispose_after_exchange")]
    pub dispose_after_exchange: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write logs to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_request_timeout() -> u64 {
    30000
}

fn default_handshake_timeout() -> u64 {
    5000
}

fn default_shutdown_grace() -> u64 {
    1000
}

fn default_max_protocol_violations() -> u32 {
    3
}

fn default_launcher_args() -> Vec<String> {
    vec!["-Plugin".to_string()]
}

fn default_dispose_after_exchange() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: default_request_timeout(),
            handshake_ms: default_handshake_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_protocol_violations: default_max_protocol_violations(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            args: default_launcher_args(),
            env: HashMap::new(),
            working_directory: None,
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            dispose_after_exchange: default_dispose_after_exchange(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.handshake_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.timeouts.shutdown_grace_ms)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: self.request_timeout(),
            max_protocol_violations: self.connection.max_protocol_violations,
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            handshake_timeout: self.handshake_timeout(),
            connection: self.connection_options(),
            release_policy: self.registry.release_policy,
        }
    }

    pub fn stdio_launcher(&self) -> StdioLauncher {
        let launcher = StdioLauncher::new()
            .with_args(self.launcher.args.clone())
            .with_env(self.launcher.env.clone())
            .with_shutdown_grace(self.shutdown_grace());

        match &self.launcher.working_directory {
            Some(dir) => launcher.with_working_dir(dir.clone()),
            None => launcher,
        }
    }
}
