use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use plugin_ipc::config::{self, Config};
use plugin_ipc::credentials::{
    CredentialOutcome, CredentialProvider, CredentialRequestKind, PluginCredentialProvider,
};
use plugin_ipc::logging::{self, LogOptions};
use plugin_ipc::plugin::{DiscoveryResult, PluginRegistry};
use plugin_ipc::protocol::ContractRegistry;

#[derive(Parser, Debug)]
#[command(name = "plugin-ipc")]
#[command(about = "Talk to out-of-process credential provider plugins", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Ask a plugin for credentials for a package source
    Credentials {
        /// Plugin executable
        #[arg(long, value_name = "PATH")]
        plugin: PathBuf,

        /// Package source URI
        #[arg(long)]
        uri: Url,

        /// Ask for proxy credentials
        #[arg(long)]
        proxy: bool,

        /// Previous credentials were rejected
        #[arg(long)]
        retry: bool,

        /// The plugin must not prompt the user
        #[arg(long)]
        non_interactive: bool,

        /// Print the password instead of masking it
        #[arg(long)]
        show_password: bool,
    },
    /// Launch a plugin, handshake with it and dispose it
    Check {
        /// Plugin executable
        #[arg(long, value_name = "PATH")]
        plugin: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from_path(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file().context("Failed to load configuration")?,
    };

    let mut log_options = LogOptions::from(&config.logging);
    if args.debug {
        log_options.level = "debug".to_string();
    }
    if args.json_logs {
        log_options.json = true;
    }
    let _log_guard = logging::init(&log_options)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        }
    });

    let registry = build_registry(&config);

    let result = match args.command {
        Command::Credentials {
            plugin,
            uri,
            proxy,
            retry,
            non_interactive,
            show_password,
        } => {
            let kind = if proxy {
                CredentialRequestKind::Proxy
            } else {
                CredentialRequestKind::Unauthorized
            };
            let provider = PluginCredentialProvider::new(discover(&plugin)?, registry.clone())
                .with_dispose_after_exchange(config.credentials.dispose_after_exchange);

            info!(provider = %provider.id(), uri = %uri, "Requesting credentials");
            let outcome = provider
                .get_credentials(&uri, kind, retry, non_interactive, &cancel)
                .await;
            print_outcome(&outcome, show_password)
        }
        Command::Check { plugin } => check_plugin(&registry, discover(&plugin)?, &cancel).await,
    };

    registry.shutdown().await;
    result
}

fn build_registry(config: &Config) -> PluginRegistry {
    PluginRegistry::new(
        Arc::new(config.stdio_launcher()),
        Arc::new(ContractRegistry::with_defaults()),
        config.registry_options(),
    )
}

fn discover(plugin: &Path) -> Result<DiscoveryResult> {
    let discovery = DiscoveryResult::from_path(plugin);
    if !discovery.is_valid() {
        anyhow::bail!(
            "Plugin {} is not usable: {:?}",
            plugin.display(),
            discovery.file_state()
        );
    }
    Ok(discovery)
}

async fn check_plugin(
    registry: &PluginRegistry,
    discovery: DiscoveryResult,
    cancel: &CancellationToken,
) -> Result<()> {
    let lease = registry
        .acquire(&discovery, cancel)
        .await
        .with_context(|| format!("Plugin {} failed to start", discovery.identity()))?;

    let report = serde_json::to_string_pretty(&lease.info())?;
    registry.release_and_dispose(lease).await;

    println!("{report}");
    Ok(())
}

fn print_outcome(outcome: &CredentialOutcome, show_password: bool) -> Result<()> {
    let mut value = serde_json::to_value(outcome)?;
    if !show_password {
        if let Some(password) = value.pointer_mut("/value/credential/password") {
            *password = json!("********");
        }
    }
    println!("{}", serde_json::to_string_pretty(&value)?);

    if let CredentialOutcome::Error(reason) = outcome {
        anyhow::bail!("Credential exchange failed: {reason}");
    }
    Ok(())
}
