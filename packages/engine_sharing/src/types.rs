use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A class of mutually compatible instances. Alphanumeric only.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ConfigError::InvalidNamespace(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Namespace {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier of one sharing instance, unique within a browsing session.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl InstanceId {
    /// Name under which this instance's direct bridge is published.
    pub fn peer_name(&self) -> String {
        format!("esh-{}", self.0)
    }

    /// Address of the relay owned by this instance.
    pub fn relay_address(&self) -> String {
        format!("esh-relay-{}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(InstanceId)
    }
}

/// Position of a peer on a bridge. The master is always 0.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    pub const MASTER: PeerId = PeerId(0);
    pub const BROADCAST: PeerId = PeerId(u64::MAX);

    pub fn is_master(&self) -> bool {
        *self == Self::MASTER
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MASTER => f.write_str("master"),
            Self::BROADCAST => f.write_str("broadcast"),
            PeerId(n) => write!(f, "remote-{}", n),
        }
    }
}
