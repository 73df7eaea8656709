use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::value::{Uncased, UncasedStr};
use figment::Figment;
use std::path::{Path, PathBuf};

use super::schema::Config;
use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "PLUGIN_IPC_";
const CONFIG_DIR: &str = "plugin-ipc";

/// Load from the user config file (if any) and the environment.
pub fn load_from_env_or_file() -> Result<Config> {
    extract(build(user_config_file(), None, ENV_PREFIX)?)
}

/// Like [`load_from_env_or_file`], with `path` layered on top of the user
/// config file.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ConfigError::Parse(format!("config file not found: {}", path.display())).into());
    }
    extract(build(user_config_file(), Some(path), ENV_PREFIX)?)
}

pub fn validate(config: &Config) -> Result<()> {
    let timeouts = [
        ("timeouts.requestMs", config.timeouts.request_ms),
        ("timeouts.handshakeMs", config.timeouts.handshake_ms),
        ("timeouts.shutdownGraceMs", config.timeouts.shutdown_grace_ms),
    ];
    for (key, value) in timeouts {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{key} must be greater than 0")).into());
        }
    }

    if config.connection.max_protocol_violations == 0 {
        return Err(ConfigError::Validation(
            "connection.maxProtocolViolations must be greater than 0".into(),
        )
        .into());
    }

    if config.logging.level.trim().is_empty() {
        return Err(ConfigError::Validation("logging.level must not be empty".into()).into());
    }

    Ok(())
}

/// `~/.config/plugin-ipc/config.{toml,json,yaml}`, first one that exists.
fn user_config_file() -> Option<PathBuf> {
    let dir = dirs::config_dir()?.join(CONFIG_DIR);
    ["config.toml", "config.json", "config.yaml", "config.yml"]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

fn build(user_file: Option<PathBuf>, explicit: Option<&Path>, env_prefix: &str) -> Result<Figment> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    for path in user_file.iter().map(PathBuf::as_path).chain(explicit) {
        figment = merge_file(figment, path)?;
    }

    Ok(figment.merge(
        Env::prefixed(env_prefix)
            .split("__")
            .map(camel_case_key)
            .lowercase(false),
    ))
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(figment.merge(Toml::file(path))),
        Some("json") => Ok(figment.merge(Json::file(path))),
        Some("yaml") | Some("yml") => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::Parse(
            "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
        )
        .into()),
    }
}

fn extract(figment: Figment) -> Result<Config> {
    let config: Config = figment
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// `CONNECTION.MAX_PROTOCOL_VIOLATIONS` -> `connection.maxProtocolViolations`
fn camel_case_key(key: &UncasedStr) -> Uncased<'_> {
    key.as_str()
        .split('.')
        .map(camel_case)
        .collect::<Vec<_>>()
        .join(".")
        .into()
}

fn camel_case(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut upper = false;
    for c in segment.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}
