//! Sharing policy: what to do when a holder is found or not found.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bridge::PeerRef;
use crate::config::PolicyFileConfig;
use crate::environment::Environment;
use crate::error::ConfigError;
use crate::types::Namespace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnFound {
    Attach,
    /// Attach without the slow-link confirmation round.
    AttachFast,
    Ignore,
    Abort,
}

impl OnFound {
    pub fn is_attach(self) -> bool {
        matches!(self, Self::Attach | Self::AttachFast)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attach => "ATTACH",
            Self::AttachFast => "ATTACH_FAST",
            Self::Ignore => "IGNORE",
            Self::Abort => "ABORT",
        }
    }
}

impl fmt::Display for OnFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnFound {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ATTACH" => Ok(Self::Attach),
            "ATTACH_FAST" => Ok(Self::AttachFast),
            "IGNORE" => Ok(Self::Ignore),
            "ABORT" => Ok(Self::Abort),
            other => Err(ConfigError::UnknownOnFound(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnNotFound {
    Create,
    Abort,
    Wait,
}

impl OnNotFound {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Abort => "ABORT",
            Self::Wait => "WAIT",
        }
    }
}

impl fmt::Display for OnNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnNotFound {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "ABORT" => Ok(Self::Abort),
            "WAIT" => Ok(Self::Wait),
            other => Err(ConfigError::UnknownOnNotFound(other.to_string())),
        }
    }
}

/// Validated sharing configuration. Immutable once discovery starts.
#[derive(Clone, Debug)]
pub struct SharingPolicy {
    namespace: Namespace,
    on_found: OnFound,
    on_not_found: OnNotFound,
    local_only: bool,
    preferred_target: Option<PeerRef>,
}

impl SharingPolicy {
    /// Fails if the namespace is invalid or an attach policy is requested
    /// across contexts in an environment that cannot reach other contexts.
    pub fn new(
        namespace: &str,
        on_found: OnFound,
        on_not_found: OnNotFound,
        local_only: bool,
        env: &dyn Environment,
    ) -> Result<Self, ConfigError> {
        let namespace = Namespace::new(namespace)?;
        if on_found.is_attach() && !local_only && !env.can_hold_references() {
            return Err(ConfigError::AttachUnsupported(on_found.to_string()));
        }
        Ok(Self {
            namespace,
            on_found,
            on_not_found,
            local_only,
            preferred_target: None,
        })
    }

    pub fn from_file(fc: &PolicyFileConfig, env: &dyn Environment) -> Result<Self, ConfigError> {
        Self::new(
            &fc.namespace,
            fc.on_found.parse()?,
            fc.on_not_found.parse()?,
            fc.local_only,
            env,
        )
    }

    /// Try this context first.
    pub fn with_preferred_target(mut self, target: PeerRef) -> Self {
        self.preferred_target = Some(target);
        self
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn on_found(&self) -> OnFound {
        self.on_found
    }

    pub fn on_not_found(&self) -> OnNotFound {
        self.on_not_found
    }

    pub fn local_only(&self) -> bool {
        self.local_only
    }

    pub fn preferred_target(&self) -> Option<&PeerRef> {
        self.preferred_target.as_ref()
    }

    /// Policy for an instance that must itself become electable, e.g.
    /// after losing a race or its holder. An instance that was trying to
    /// attach creates instead of waiting.
    pub fn election_variant(&self) -> Self {
        let on_not_found = if self.on_found.is_attach() {
            OnNotFound::Create
        } else {
            self.on_not_found
        };
        Self {
            namespace: self.namespace.clone(),
            on_found: self.on_found,
            on_not_found,
            local_only: self.local_only,
            preferred_target: None,
        }
    }
}
