//! Error types for the sharing subsystem.
//!
//! Only [`ConfigError`] is ever surfaced to a caller as a hard failure.
//! Storage, messaging and conflict outcomes are recovered locally and
//! reported through events.

use std::time::Duration;

use crate::types::InstanceId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid namespace {0:?}: must be non-empty and alphanumeric")]
    InvalidNamespace(String),

    #[error("unknown on_found policy: {0}")]
    UnknownOnFound(String),

    #[error("unknown on_not_found policy: {0}")]
    UnknownOnNotFound(String),

    #[error("{0} requires a context able to hold cross-context references")]
    AttachUnsupported(String),

    #[error("invalid resource key {0:?}: must not contain '_' or '|'")]
    InvalidResourceKey(String),

    #[error("store {0} needs a path")]
    MissingStorePath(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key rejected by store: {0:?}")]
    KeyRejected(String),

    #[error("value rejected by store for key {0:?}")]
    ValueRejected(String),

    #[error("value for {key:?} is {len} bytes, limit is {limit}")]
    ValueTooLarge {
        key: String,
        len: usize,
        limit: usize,
    },

    #[error("store is full ({0} entries)")]
    Full(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("call {message_id} timed out after {timeout_ms}ms")]
    Timeout { message_id: String, timeout_ms: u64 },

    #[error("delivery of {message_id} failed")]
    DeliveryFailed { message_id: String },

    #[error("channel closed")]
    Closed,

    #[error("call dropped: session token {token} is stale")]
    Stale { token: u64 },

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("remote call failed: {0}")]
    Remote(String),
}

impl CallError {
    /// Whether the peer should be considered gone.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::DeliveryFailed { .. } | Self::Closed
        )
    }
}

/// Why attaching to a discovered holder failed. Never fatal: the holder
/// is blacklisted and discovery goes on.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("holder {0} cannot be reached at any advertised address")]
    Unreachable(InstanceId),

    #[error("holder {0} did not answer within {1:?}")]
    Timeout(InstanceId, Duration),

    #[error("bridge to holder {0} terminated during attach")]
    Terminated(InstanceId),

    #[error(transparent)]
    Call(#[from] CallError),
}

#[derive(Debug, thiserror::Error)]
pub enum SharingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sharing aborted by policy")]
    Aborted,

    #[error("discovery cancelled")]
    Cancelled,
}
