use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::StoreKind;

// =============================================================================
// File config (deserialized by the embedding application, e.g. via figment)
// =============================================================================
//
//   share.toml:      [timing]
//                    heartbeat_ms = 1000
//
//   env var:         SHARE_TIMING__HEARTBEAT_MS=1000

/// Top-level tunable configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SharingFileConfig {
    #[serde(default)]
    pub timing: TimingFileConfig,
    #[serde(default)]
    pub store: StoreFileConfig,
    #[serde(default)]
    pub sharing: PolicyFileConfig,
}

/// Timing tunables (lives under `[timing]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimingFileConfig {
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Extra age beyond one heartbeat before a record counts as stale.
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
    #[serde(default = "default_alone_timeout_ms")]
    pub alone_timeout_ms: u64,
    #[serde(default = "default_wait_delay_ms")]
    pub wait_delay_ms: u64,
    #[serde(default = "default_tie_jitter_max_ms")]
    pub tie_jitter_max_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for TimingFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            tolerance_ms: default_tolerance_ms(),
            gc_interval_ms: default_gc_interval_ms(),
            alone_timeout_ms: default_alone_timeout_ms(),
            wait_delay_ms: default_wait_delay_ms(),
            tie_jitter_max_ms: default_tie_jitter_max_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Store selection (lives under `[store]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreFileConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Sharing policy and local identity (lives under `[sharing]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyFileConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_on_found")]
    pub on_found: String,
    #[serde(default = "default_on_not_found")]
    pub on_not_found: String,
    #[serde(default)]
    pub local_only: bool,
    #[serde(default = "default_origin_host")]
    pub origin_host: String,
    #[serde(default = "default_build_id")]
    pub build_id: String,
    #[serde(default = "default_page_protocol")]
    pub page_protocol: String,
}

impl Default for PolicyFileConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            on_found: default_on_found(),
            on_not_found: default_on_not_found(),
            local_only: false,
            origin_host: default_origin_host(),
            build_id: default_build_id(),
            page_protocol: default_page_protocol(),
        }
    }
}

fn default_heartbeat_ms() -> u64 {
    1000
}
fn default_tolerance_ms() -> u64 {
    2000
}
fn default_gc_interval_ms() -> u64 {
    5000
}
fn default_alone_timeout_ms() -> u64 {
    300
}
fn default_wait_delay_ms() -> u64 {
    2000
}
fn default_tie_jitter_max_ms() -> u64 {
    150
}
fn default_call_timeout_ms() -> u64 {
    4000
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_on_found() -> String {
    "ATTACH".to_string()
}
fn default_on_not_found() -> String {
    "CREATE".to_string()
}
fn default_origin_host() -> String {
    "localhost".to_string()
}
fn default_build_id() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_page_protocol() -> String {
    "https".to_string()
}

// =============================================================================
// Runtime view
// =============================================================================

/// Resolved timings used by every component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    pub heartbeat: Duration,
    pub tolerance: Duration,
    pub gc_interval: Duration,
    pub alone_timeout: Duration,
    pub wait_delay: Duration,
    pub tie_jitter_max: Duration,
    pub call_timeout: Duration,
}

impl Timings {
    pub fn from_file(fc: &TimingFileConfig) -> Self {
        Self {
            heartbeat: Duration::from_millis(fc.heartbeat_ms.max(1)),
            tolerance: Duration::from_millis(fc.tolerance_ms),
            gc_interval: Duration::from_millis(fc.gc_interval_ms.max(1)),
            alone_timeout: Duration::from_millis(fc.alone_timeout_ms),
            wait_delay: Duration::from_millis(fc.wait_delay_ms.max(1)),
            tie_jitter_max: Duration::from_millis(fc.tie_jitter_max_ms),
            call_timeout: Duration::from_millis(fc.call_timeout_ms.max(1)),
        }
    }

    /// Age in milliseconds beyond which a presence record is stale.
    pub fn stale_after_millis(&self) -> i64 {
        i64::try_from((self.heartbeat + self.tolerance).as_millis()).unwrap_or(i64::MAX)
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self::from_file(&TimingFileConfig::default())
    }
}
