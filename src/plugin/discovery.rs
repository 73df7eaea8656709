//! Discovery results handed to the engine
//!
//! Locating plugins on disk is the caller's job; the engine only needs an
//! immutable description of what was found.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// What discovery concluded about a plugin file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginFileState {
    Valid,
    NotFound,
    InvalidPath,
}

/// Registry key: one logical plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginIdentity {
    pub path: PathBuf,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    identity: PluginIdentity,
    file_state: PluginFileState,
}

impl DiscoveryResult {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, file_state: PluginFileState) -> Self {
        Self {
            identity: PluginIdentity {
                path: path.into(),
                name: name.into(),
                version: None,
            },
            file_state,
        }
    }

    /// Describe the plugin at `path`, named after its file stem, checking
    /// that the file exists.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();

        let file_state = if path.as_os_str().is_empty() {
            PluginFileState::InvalidPath
        } else if path.is_file() {
            PluginFileState::Valid
        } else {
            PluginFileState::NotFound
        };

        Self::new(path, name, file_state)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.identity.version = Some(version.into());
        self
    }

    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        &self.identity.path
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn file_state(&self) -> PluginFileState {
        self.file_state
    }

    pub fn is_valid(&self) -> bool {
        self.file_state == PluginFileState::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_path_existing_file() {
        let file = NamedTempFile::new().unwrap();
        let result = DiscoveryResult::from_path(file.path());

        assert!(result.is_valid());
        assert_eq!(result.path(), file.path());
        assert!(!result.name().is_empty());
    }

    #[test]
    fn test_from_path_missing_file() {
        let result = DiscoveryResult::from_path("/no/such/CredentialProvider.Test.exe");
        assert_eq!(result.file_state(), PluginFileState::NotFound);
        assert_eq!(result.name(), "CredentialProvider.Test");
    }

    #[test]
    fn test_from_empty_path() {
        let result = DiscoveryResult::from_path("");
        assert_eq!(result.file_state(), PluginFileState::InvalidPath);
    }

    #[test]
    fn test_identity_includes_version() {
        let a = DiscoveryResult::new("/p/a", "a", PluginFileState::Valid);
        let b = a.clone().with_version("1.2.0");

        assert_ne!(a.identity(), b.identity());
        assert_eq!(b.identity().to_string(), "a@1.2.0");
    }
}
