//! Background janitor for the shared store.
//!
//! One collector per context, started by the first lease and stopped when
//! the last lease is dropped. Each sweep removes presence records older
//! than heartbeat + tolerance (and malformed ones), then compacts every id
//! list down to ids that still own a live record. A list named after a
//! namespace keeps only ids live in that namespace; a resource list keeps
//! ids live anywhere. Sweeps are idempotent
//! and safe next to other contexts' heartbeats: an id removed while its
//! owner is still alive is re-added on the owner's next heartbeat.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::Timings;
use crate::store::status::{KeyKind, RecordState, StatusStore, classify_key};
use crate::types::{InstanceId, Namespace};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub records_removed: usize,
    pub ids_removed: usize,
}

#[derive(Debug, Default)]
struct CollectorState {
    leases: usize,
    cancel: Option<CancellationToken>,
}

#[derive(Debug)]
struct CollectorInner {
    status: StatusStore,
    clock: SharedClock,
    timings: Timings,
    state: Mutex<CollectorState>,
}

#[derive(Clone, Debug)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

/// Keeps the collector running while alive.
#[derive(Debug)]
pub struct CollectorLease {
    collector: Collector,
}

impl Drop for CollectorLease {
    fn drop(&mut self) {
        self.collector.release();
    }
}

impl Collector {
    pub fn new(status: StatusStore, clock: SharedClock, timings: Timings) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                status,
                clock,
                timings,
                state: Mutex::new(CollectorState::default()),
            }),
        }
    }

    /// Start sweeping if nobody else asked for it yet. The first call must
    /// happen inside a tokio runtime.
    pub fn acquire(&self) -> CollectorLease {
        let mut state = self.state();
        state.leases += 1;
        if state.cancel.is_none() {
            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            tokio::spawn(self.clone().run(cancel));
            info!(interval = ?self.inner.timings.gc_interval, "collector started");
        }
        CollectorLease {
            collector: self.clone(),
        }
    }

    pub fn lease_count(&self) -> usize {
        self.state().leases
    }

    pub fn is_running(&self) -> bool {
        self.state().cancel.is_some()
    }

    fn release(&self) {
        let mut state = self.state();
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 {
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
                info!("collector stopped");
            }
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let period = self.inner.timings.gc_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }

    /// One pass over every key of this subsystem.
    pub fn sweep(&self) -> SweepReport {
        let status = &self.inner.status;
        let now = self.inner.clock.now_millis();
        let stale_after = self.inner.timings.stale_after_millis();
        let keys = status.get_all_keys();

        let mut report = SweepReport::default();
        let mut live: HashSet<(InstanceId, &str)> = HashSet::new();
        let mut live_anywhere: HashSet<InstanceId> = HashSet::new();
        let mut lists = Vec::new();

        for key in &keys {
            match classify_key(key) {
                Some(KeyKind::Presence { id, namespace }) => match status.inspect_key(key) {
                    RecordState::Present(record) if !record.is_stale(now, stale_after) => {
                        live.insert((id, namespace));
                        live_anywhere.insert(id);
                    }
                    RecordState::Present(record) => {
                        debug!(%id, age_ms = record.age_millis(now), "removing stale presence record");
                        if status.clean_raw(key) {
                            report.records_removed += 1;
                        }
                    }
                    RecordState::Malformed => {
                        debug!(key = %key, "removing malformed presence record");
                        if status.clean_raw(key) {
                            report.records_removed += 1;
                        }
                    }
                    RecordState::Absent => {}
                },
                Some(KeyKind::IdList { name }) => lists.push(name),
                None => debug!(key = %key, "ignoring unrecognized key"),
            }
        }

        for name in lists {
            let is_namespace = Namespace::new(name).is_ok();
            let ids = status.read_ids(name);
            let kept: Vec<InstanceId> = ids
                .iter()
                .copied()
                .filter(|id| {
                    if is_namespace {
                        live.contains(&(*id, name))
                    } else {
                        live_anywhere.contains(id)
                    }
                })
                .collect();
            if kept.len() != ids.len() {
                report.ids_removed += ids.len() - kept.len();
                status.write_ids(name, &kept);
            }
        }

        if report != SweepReport::default() {
            debug!(
                records_removed = report.records_removed,
                ids_removed = report.ids_removed,
                "sweep done"
            );
        }
        report
    }

    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
