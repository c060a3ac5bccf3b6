//! Presence leases and conflict resolution.
//!
//! A holder advertises itself by rewriting its presence record every
//! heartbeat. Each tick it also looks at the other compatible members of
//! its namespace. A competitor whose timestamp is strictly newer than our
//! last write is a conflict: we skip the refresh and remember it. Seeing
//! the same competitor newer again on the next tick means it kept
//! heartbeating while we stood still, so we withdraw ("suicide") and let
//! the owner re-run discovery. An exact timestamp tie shifts our next
//! tick by a random offset so two symmetric competitors drift apart.
//!
//! Every scheduled continuation captures the phase it was started in and
//! becomes a no-op once the phase moved on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::sharing::SharingDeps;
use crate::store::status::{PresenceRecord, valid_list_name};
use crate::types::{InstanceId, Namespace};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceMode {
    /// Visible to this context only, through the directory.
    LocalOnly,
    /// Heartbeat into the shared store. `compare` enables conflict
    /// detection against other members of the namespace.
    CrossContext { compare: bool },
}

/// Why a presence ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Withdrawal {
    /// Lost to a newer competitor.
    Suicide { winner: InstanceId },
    Disposed,
}

/// Outcome of one heartbeat tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tick {
    Refreshed,
    Conflict,
    Withdrawn,
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PresenceState {
    phase: u64,
    running: bool,
    mode: Option<PresenceMode>,
    last_timestamp: i64,
    newer: HashMap<InstanceId, i64>,
    dont_die_for: HashSet<InstanceId>,
    resource_keys: Vec<String>,
    direct_address: Option<String>,
    worker_address: Option<String>,
    jitter: Duration,
    release: Option<ReleaseHook>,
    notify: Option<oneshot::Sender<Withdrawal>>,
}

struct PresenceInner {
    id: InstanceId,
    namespace: Namespace,
    deps: SharingDeps,
    state: Mutex<PresenceState>,
}

/// Presence of one instance in one namespace.
#[derive(Clone)]
pub struct PresenceEngine {
    inner: Arc<PresenceInner>,
}

impl std::fmt::Debug for PresenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("PresenceEngine")
            .field("id", &self.inner.id)
            .field("namespace", &self.inner.namespace)
            .field("running", &state.running)
            .field("last_timestamp", &state.last_timestamp)
            .finish()
    }
}

impl PresenceEngine {
    pub fn new(id: InstanceId, namespace: Namespace, deps: &SharingDeps) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                id,
                namespace,
                deps: deps.clone(),
                state: Mutex::new(PresenceState::default()),
            }),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.inner.id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Timestamp of our last presence write, 0 before the first one.
    pub fn last_timestamp(&self) -> i64 {
        self.state().last_timestamp
    }

    /// Extra delay queued for the next heartbeat after a tie.
    pub fn pending_jitter(&self) -> Duration {
        self.state().jitter
    }

    /// Also keep membership in the id list `key`, e.g. `connections-to-srv`.
    pub fn add_resource_key(&self, key: &str) -> Result<(), ConfigError> {
        if !valid_list_name(key) {
            return Err(ConfigError::InvalidResourceKey(key.to_string()));
        }
        let running_cross = {
            let mut state = self.state();
            if !state.resource_keys.iter().any(|k| k == key) {
                state.resource_keys.push(key.to_string());
            }
            state.running && matches!(state.mode, Some(PresenceMode::CrossContext { .. }))
        };
        if running_cross {
            self.inner.deps.status.add_id(key, self.inner.id);
        }
        Ok(())
    }

    /// Competitors that never make us withdraw.
    pub fn set_dont_die_for(&self, ids: HashSet<InstanceId>) {
        self.state().dont_die_for = ids;
    }

    /// Runs once, right before the withdrawal is reported.
    pub fn set_release(&self, release: impl FnOnce() + Send + 'static) {
        self.state().release = Some(Box::new(release));
    }

    /// Switch the advertised addresses. Written right away unless a
    /// conflict is pending.
    pub fn change_addresses(&self, direct: Option<String>, worker: Option<String>) {
        let refresh = {
            let mut state = self.state();
            state.direct_address = direct;
            state.worker_address = worker;
            state.running
                && state.newer.is_empty()
                && matches!(state.mode, Some(PresenceMode::CrossContext { .. }))
        };
        if refresh {
            self.refresh();
        }
    }

    /// Start advertising. The receiver fires once when the presence ends.
    /// Cross-context mode needs a tokio runtime.
    pub fn start(&self, mode: PresenceMode) -> oneshot::Receiver<Withdrawal> {
        let (tx, rx) = oneshot::channel();
        let phase = {
            let mut state = self.state();
            state.phase += 1;
            state.running = true;
            state.mode = Some(mode);
            state.newer.clear();
            state.notify = Some(tx);
            state.phase
        };

        match mode {
            PresenceMode::LocalOnly => {
                self.inner
                    .deps
                    .directory
                    .register_presence(&self.inner.namespace, self.inner.id);
                info!(id = %self.inner.id, namespace = %self.inner.namespace, "presence started (local only)");
            }
            PresenceMode::CrossContext { compare } => {
                self.register_membership();
                self.refresh();
                info!(id = %self.inner.id, namespace = %self.inner.namespace, compare, "presence started");
                tokio::spawn(self.clone().heartbeat(phase, compare));
            }
        }
        rx
    }

    /// Clean withdrawal on shutdown.
    pub fn dispose(&self) {
        self.withdraw(Withdrawal::Disposed);
    }

    async fn heartbeat(self, phase: u64, compare: bool) {
        loop {
            let delay = self.inner.deps.timings.heartbeat + self.take_jitter();
            tokio::time::sleep(delay).await;
            if self.state().phase != phase {
                break;
            }
            if self.tick(compare) == Tick::Withdrawn {
                break;
            }
        }
    }

    /// One heartbeat round.
    pub(crate) fn tick(&self, compare: bool) -> Tick {
        let (last, dont_die_for, previous) = {
            let state = self.state();
            if !state.running {
                return Tick::Withdrawn;
            }
            (state.last_timestamp, state.dont_die_for.clone(), state.newer.clone())
        };

        self.register_membership();
        if !compare {
            self.refresh();
            return Tick::Refreshed;
        }

        let status = &self.inner.deps.status;
        let namespace = &self.inner.namespace;
        let mut newer = HashMap::new();
        let mut tie = false;
        for id in status.read_ids(namespace.as_str()) {
            if id == self.inner.id || dont_die_for.contains(&id) {
                continue;
            }
            let Some(record) = status.read_shared_status(id, namespace) else {
                continue;
            };
            if !record.is_compatible(&self.inner.deps.origin) {
                continue;
            }
            if record.timestamp > last {
                newer.insert(id, record.timestamp);
            } else if record.timestamp == last {
                tie = true;
            }
        }

        if tie {
            self.queue_jitter();
        }

        if let Some(winner) = newer.keys().copied().find(|id| previous.contains_key(id)) {
            info!(id = %self.inner.id, namespace = %namespace, %winner, "newer holder seen twice, withdrawing");
            self.withdraw(Withdrawal::Suicide { winner });
            return Tick::Withdrawn;
        }

        if !newer.is_empty() {
            debug!(id = %self.inner.id, namespace = %namespace, competitors = newer.len(), "newer competitor, skipping refresh");
            self.state().newer = newer;
            return Tick::Conflict;
        }

        self.state().newer.clear();
        self.refresh();
        Tick::Refreshed
    }

    fn register_membership(&self) {
        let keys = self.state().resource_keys.clone();
        let status = &self.inner.deps.status;
        if status.add_id(self.inner.namespace.as_str(), self.inner.id) {
            debug!(id = %self.inner.id, namespace = %self.inner.namespace, "joined id list");
        }
        for key in keys {
            status.add_id(&key, self.inner.id);
        }
    }

    fn refresh(&self) {
        let now = self.inner.deps.clock.now_millis();
        let record = {
            let mut state = self.state();
            if !state.running {
                return;
            }
            state.last_timestamp = now;
            PresenceRecord::new(
                now,
                &self.inner.deps.origin,
                state.direct_address.clone(),
                state.worker_address.clone(),
            )
        };
        if !self
            .inner
            .deps
            .status
            .write_shared_status(self.inner.id, &self.inner.namespace, &record)
        {
            warn!(id = %self.inner.id, namespace = %self.inner.namespace, "presence refresh not written");
        }
    }

    fn queue_jitter(&self) {
        let max = u64::try_from(self.inner.deps.timings.tie_jitter_max.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return;
        }
        let offset = Duration::from_millis(rand::rng().random_range(1..=max));
        debug!(id = %self.inner.id, offset = ?offset, "timestamp tie, shifting next heartbeat");
        self.state().jitter = offset;
    }

    fn take_jitter(&self) -> Duration {
        std::mem::take(&mut self.state().jitter)
    }

    /// Remove every trace of this presence. Runs once per start.
    fn withdraw(&self, reason: Withdrawal) {
        let (mode, keys, release, notify) = {
            let mut state = self.state();
            if !state.running {
                return;
            }
            state.running = false;
            state.phase += 1;
            state.newer.clear();
            (
                state.mode,
                state.resource_keys.clone(),
                state.release.take(),
                state.notify.take(),
            )
        };

        let id = self.inner.id;
        let namespace = &self.inner.namespace;
        match mode {
            Some(PresenceMode::LocalOnly) => {
                self.inner.deps.directory.unregister_presence(namespace, id);
            }
            Some(PresenceMode::CrossContext { .. }) => {
                let status = &self.inner.deps.status;
                status.clean_shared_status(id, namespace);
                status.remove_id(namespace.as_str(), id);
                for key in &keys {
                    status.remove_id(key, id);
                }
            }
            None => {}
        }

        if let Some(release) = release {
            release();
        }
        info!(%id, namespace = %namespace, ?reason, "presence withdrawn");
        if let Some(notify) = notify {
            let _ = notify.send(reason);
        }
    }

    fn state(&self) -> MutexGuard<'_, PresenceState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
