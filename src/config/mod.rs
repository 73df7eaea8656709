//! Host configuration
//!
//! Layered with figment: built-in defaults, then the user config file, then
//! an explicit `--config` file, then `PLUGIN_IPC_*` environment variables.

pub mod loader;
pub mod schema;

pub use loader::{load_from_env_or_file, load_from_path, validate};
pub use schema::{
    Config, ConnectionConfig, CredentialsConfig, LauncherConfig, LoggingConfig, RegistryConfig,
    TimeoutConfig,
};
