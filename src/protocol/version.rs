use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::error::ContractError;

/// Version offered by this host during the handshake.
pub const CURRENT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(2, 0, 0);

/// Oldest plugin protocol version this host still talks to.
pub const MINIMUM_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

/// `major.minor.patch` protocol version exchanged in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether a plugin speaking `self` is acceptable to a host that supports
    /// `[minimum, current]`.
    pub fn is_within(&self, minimum: ProtocolVersion, current: ProtocolVersion) -> bool {
        *self >= minimum && *self <= current
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ContractError::Malformed {
            message: "protocol version".to_string(),
            reason: format!("expected major.minor.patch, got '{s}'"),
        };

        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, ContractError> {
            parts
                .next()
                .ok_or_else(malformed)?
                .parse::<u32>()
                .map_err(|_| malformed())
        };

        let version = ProtocolVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(version)
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
