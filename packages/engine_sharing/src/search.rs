//! Discovery: find a holder to attach to, or decide to become one.
//!
//! A run walks the namespace's id list once per round. Candidates that
//! advertise a relay (or any candidate under `ATTACH_FAST`) are trusted
//! right away. Candidates reachable only through a direct reference must
//! prove they are still heartbeating: we look again one heartbeat later
//! and keep them only if their timestamp moved.
//!
//! Every await is followed by a phase check, so [`Search::cancel`] (or a
//! newer run) turns an older run into `Err(Cancelled)` at its next step.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::PeerRef;
use crate::engine::{EngineHandle, SessionEngine};
use crate::error::SharingError;
use crate::policy::{OnFound, OnNotFound, SharingPolicy};
use crate::remote;
use crate::sharing::SharingDeps;
use crate::store::status::{PresenceRecord, RecordState};
use crate::types::InstanceId;

#[derive(Debug)]
pub enum SearchOutcome {
    Attached(EngineHandle),
    /// Nobody to attach to: become the holder.
    Create,
    Fail,
}

/// A holder worth attaching to.
enum Found {
    Local {
        id: InstanceId,
        engine: Arc<dyn SessionEngine>,
    },
    Stored {
        id: InstanceId,
        record: PresenceRecord,
        peer: Option<PeerRef>,
    },
}

impl Found {
    fn id(&self) -> InstanceId {
        match self {
            Self::Local { id, .. } | Self::Stored { id, .. } => *id,
        }
    }
}

#[derive(Default)]
struct Scan {
    fast: Option<(InstanceId, PresenceRecord)>,
    slow: Vec<(InstanceId, PresenceRecord)>,
}

struct SearchInner {
    policy: SharingPolicy,
    deps: SharingDeps,
    phase: AtomicU64,
    checked: Mutex<HashSet<InstanceId>>,
}

#[derive(Clone)]
pub struct Search {
    inner: Arc<SearchInner>,
}

impl std::fmt::Debug for Search {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Search")
            .field("namespace", self.inner.policy.namespace())
            .field("phase", &self.inner.phase.load(Ordering::SeqCst))
            .field("checked", &*self.checked())
            .finish()
    }
}

impl Search {
    pub fn new(policy: SharingPolicy, deps: SharingDeps) -> Self {
        Self {
            inner: Arc::new(SearchInner {
                policy,
                deps,
                phase: AtomicU64::new(0),
                checked: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Never consider these ids.
    pub fn with_blacklist(self, ids: impl IntoIterator<Item = InstanceId>) -> Self {
        self.checked().extend(ids);
        self
    }

    pub fn is_checked(&self, id: InstanceId) -> bool {
        self.checked().contains(&id)
    }

    /// Abandon the current run.
    pub fn cancel(&self) {
        self.inner.phase.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn run(&self) -> Result<SearchOutcome, SharingError> {
        let phase = self.inner.phase.fetch_add(1, Ordering::SeqCst) + 1;
        let policy = &self.inner.policy;
        let namespace = policy.namespace();

        match (policy.on_found(), policy.on_not_found()) {
            (OnFound::Ignore | OnFound::Abort, OnNotFound::Abort) => {
                debug!(namespace = %namespace, "nothing can succeed, failing fast");
                return Ok(SearchOutcome::Fail);
            }
            (OnFound::Ignore, OnNotFound::Create) => {
                debug!(namespace = %namespace, "ignoring holders, creating");
                return Ok(SearchOutcome::Create);
            }
            _ => {}
        }

        let mut preferred = policy.preferred_target().cloned();
        loop {
            self.check_phase(phase)?;
            let found = if policy.local_only() {
                self.find_local()
            } else {
                self.find_stored(phase, preferred.take()).await?
            };

            if let Some(found) = found {
                let id = found.id();
                match policy.on_found() {
                    OnFound::Abort => {
                        info!(namespace = %namespace, holder = %id, "holder found, aborting");
                        return Ok(SearchOutcome::Fail);
                    }
                    OnFound::Ignore => {
                        debug!(namespace = %namespace, holder = %id, "holder found, ignoring");
                    }
                    OnFound::Attach | OnFound::AttachFast => match self.attach(found).await {
                        Ok(handle) => {
                            if self.check_phase(phase).is_err() {
                                handle.close();
                                return Err(SharingError::Cancelled);
                            }
                            return Ok(SearchOutcome::Attached(handle));
                        }
                        Err(e) => {
                            warn!(namespace = %namespace, holder = %id, error = %e, "attach failed, trying again");
                            self.blacklist(id);
                            continue;
                        }
                    },
                }
            }

            match policy.on_not_found() {
                OnNotFound::Create => return Ok(SearchOutcome::Create),
                OnNotFound::Abort => return Ok(SearchOutcome::Fail),
                OnNotFound::Wait => {
                    debug!(namespace = %namespace, delay = ?self.inner.deps.timings.wait_delay, "waiting for a holder");
                    tokio::time::sleep(self.inner.deps.timings.wait_delay).await;
                }
            }
        }
    }

    fn find_local(&self) -> Option<Found> {
        let (id, engine) = self.inner.deps.directory.lookup(self.inner.policy.namespace())?;
        if self.is_checked(id) {
            return None;
        }
        Some(Found::Local { id, engine })
    }

    async fn find_stored(&self, phase: u64, preferred: Option<PeerRef>) -> Result<Option<Found>, SharingError> {
        if let Some(peer) = preferred {
            if let Some(found) = self.through_preferred(peer) {
                return Ok(Some(found));
            }
        }

        let timings = self.inner.deps.timings;
        let mut first_round = true;
        loop {
            let scan = self.scan();
            if let Some((id, record)) = scan.fast {
                return Ok(Some(Found::Stored { id, record, peer: None }));
            }

            if !scan.slow.is_empty() {
                self.sleep(timings.heartbeat, phase).await?;
                return Ok(self.confirm(scan.slow));
            }

            if first_round && !timings.alone_timeout.is_zero() {
                first_round = false;
                self.sleep(timings.alone_timeout, phase).await?;
                continue;
            }
            return Ok(None);
        }
    }

    /// Resolve the preferred reference straight to its holder's record.
    fn through_preferred(&self, peer: PeerRef) -> Option<Found> {
        let (id, namespace) = peer.holder()?;
        if self.is_checked(id) {
            return None;
        }
        if namespace != self.inner.policy.namespace() || !peer.is_alive() {
            debug!(holder = %id, "preferred target not usable");
            self.blacklist(id);
            return None;
        }

        let deps = &self.inner.deps;
        match deps.status.inspect(id, namespace) {
            RecordState::Present(record)
                if record.is_compatible(&deps.origin)
                    && !record.is_stale(deps.clock.now_millis(), deps.timings.stale_after_millis()) =>
            {
                debug!(holder = %id, "preferred target is live");
                Some(Found::Stored {
                    id,
                    record,
                    peer: Some(peer.clone()),
                })
            }
            _ => {
                debug!(holder = %id, "preferred target has no live record");
                self.blacklist(id);
                None
            }
        }
    }

    /// One pass over the id list.
    fn scan(&self) -> Scan {
        let deps = &self.inner.deps;
        let namespace = self.inner.policy.namespace();
        let now = deps.clock.now_millis();
        let stale_after = deps.timings.stale_after_millis();
        let attach_fast = self.inner.policy.on_found() == OnFound::AttachFast;

        let mut scan = Scan::default();
        for id in deps.status.read_ids(namespace.as_str()) {
            if self.is_checked(id) {
                continue;
            }
            let record = match deps.status.inspect(id, namespace) {
                RecordState::Absent => continue,
                RecordState::Malformed => {
                    self.discard(id, "malformed");
                    continue;
                }
                RecordState::Present(record) => record,
            };
            if !record.is_compatible(&deps.origin) {
                self.discard(id, "incompatible");
                continue;
            }
            if record.is_stale(now, stale_after) {
                self.discard(id, "stale");
                continue;
            }

            if record.is_fast_link() || attach_fast {
                let fresher = scan
                    .fast
                    .as_ref()
                    .is_none_or(|(_, best)| record.timestamp > best.timestamp);
                if fresher {
                    scan.fast = Some((id, record));
                }
            } else {
                scan.slow.push((id, record));
            }
        }
        scan
    }

    /// Keep the freshest provisional candidate that heartbeated since.
    fn confirm(&self, candidates: Vec<(InstanceId, PresenceRecord)>) -> Option<Found> {
        let deps = &self.inner.deps;
        let namespace = self.inner.policy.namespace();
        let mut best: Option<(InstanceId, PresenceRecord)> = None;
        for (id, before) in candidates {
            match deps.status.read_shared_status(id, namespace) {
                Some(now) if now.timestamp > before.timestamp && now.is_compatible(&deps.origin) => {
                    if best.as_ref().is_none_or(|(_, b)| now.timestamp > b.timestamp) {
                        best = Some((id, now));
                    }
                }
                _ => debug!(candidate = %id, "candidate did not heartbeat, dropping"),
            }
        }
        best.map(|(id, record)| Found::Stored { id, record, peer: None })
    }

    async fn attach(&self, found: Found) -> Result<EngineHandle, crate::error::AttachError> {
        match found {
            Found::Local { id, engine } => Ok(EngineHandle::local(engine, Some(id))),
            Found::Stored { id, record, peer } => remote::attach(id, &record, peer, &self.inner.deps).await,
        }
    }

    /// Eagerly collect a record nobody can use, and stop looking at it.
    fn discard(&self, id: InstanceId, reason: &str) {
        let status = &self.inner.deps.status;
        let namespace = self.inner.policy.namespace();
        debug!(candidate = %id, namespace = %namespace, reason, "discarding record");
        status.clean_shared_status(id, namespace);
        status.remove_id(namespace.as_str(), id);
        self.blacklist(id);
    }

    fn blacklist(&self, id: InstanceId) {
        self.checked().insert(id);
    }

    async fn sleep(&self, delay: Duration, phase: u64) -> Result<(), SharingError> {
        tokio::time::sleep(delay).await;
        self.check_phase(phase)
    }

    fn check_phase(&self, phase: u64) -> Result<(), SharingError> {
        if self.inner.phase.load(Ordering::SeqCst) == phase {
            Ok(())
        } else {
            Err(SharingError::Cancelled)
        }
    }

    fn checked(&self) -> MutexGuard<'_, HashSet<InstanceId>> {
        self.inner.checked.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::directory::Directory;
    use crate::engine::RecordingEngine;
    use crate::environment::LocalEnvironment;
    use crate::store::{MemoryStore, SharedStore};
    use crate::store::status::Origin;
    use crate::types::Namespace;
    use tokio::time::Instant;

    const NOW: i64 = 1_000_000;

    fn deps(store: Arc<MemoryStore>, env: Arc<LocalEnvironment>) -> SharingDeps {
        SharingDeps::new(
            store,
            env,
            Arc::new(Directory::starting_at(1)),
            Origin::new("h", "b1", "https"),
        )
        .with_clock(Arc::new(TokioClock::starting_at(NOW)))
    }

    fn policy(on_found: OnFound, on_not_found: OnNotFound, env: &LocalEnvironment) -> SharingPolicy {
        SharingPolicy::new("app1", on_found, on_not_found, false, env).unwrap()
    }

    fn ns() -> Namespace {
        Namespace::new("app1").unwrap()
    }

    fn advertise(deps: &SharingDeps, id: u64, record: PresenceRecord) {
        deps.status.add_id("app1", InstanceId(id));
        deps.status.write_shared_status(InstanceId(id), &ns(), &record);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_paths_skip_the_store() {
        let store = Arc::new(MemoryStore::new());
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(store.clone(), env.clone());

        let fail = Search::new(policy(OnFound::Ignore, OnNotFound::Abort, &env), deps.clone());
        assert!(matches!(fail.run().await.unwrap(), SearchOutcome::Fail));
        let create = Search::new(policy(OnFound::Ignore, OnNotFound::Create, &env), deps);
        assert!(matches!(create.run().await.unwrap(), SearchOutcome::Create));
        assert_eq!(store.read_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn alone_creates_after_alone_timeout() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(Arc::new(MemoryStore::new()), env.clone());
        let search = Search::new(policy(OnFound::Attach, OnNotFound::Create, &env), deps.clone());

        let started = Instant::now();
        assert!(matches!(search.run().await.unwrap(), SearchOutcome::Create));
        assert_eq!(started.elapsed(), deps.timings.alone_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_incompatible_and_malformed_are_collected() {
        let store = Arc::new(MemoryStore::new());
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(store.clone(), env.clone());
        advertise(&deps, 2, PresenceRecord::new(NOW - 10_000, &deps.origin, None, Some("esh-relay-2".into())));
        advertise(&deps, 3, PresenceRecord::new(NOW, &Origin::new("h", "b2", "https"), None, None));
        deps.status.add_id("app1", InstanceId(4));
        store.write("esh.4_app1", "junk").unwrap();
        // listed but without a record: skipped, left to the collector
        deps.status.add_id("app1", InstanceId(5));

        let search = Search::new(policy(OnFound::Abort, OnNotFound::Create, &env), deps.clone());
        assert!(matches!(search.run().await.unwrap(), SearchOutcome::Create));
        for id in [2, 3, 4] {
            assert!(search.is_checked(InstanceId(id)));
        }
        assert!(!search.is_checked(InstanceId(5)));
        assert_eq!(deps.status.read_ids("app1"), vec![InstanceId(5)]);
        assert_eq!(deps.status.get_all_keys(), vec!["esh.app1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_link_is_found_without_delay() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(Arc::new(MemoryStore::new()), env.clone());
        advertise(&deps, 2, PresenceRecord::new(NOW, &deps.origin, None, Some("esh-relay-2".into())));

        let search = Search::new(policy(OnFound::Abort, OnNotFound::Create, &env), deps);
        let started = Instant::now();
        assert!(matches!(search.run().await.unwrap(), SearchOutcome::Fail));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_fast_trusts_direct_candidates() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(Arc::new(MemoryStore::new()), env.clone());
        advertise(&deps, 2, PresenceRecord::new(NOW, &deps.origin, Some("esh-2".into()), None));
        deps.directory.register_engine(InstanceId(2), Arc::new(RecordingEngine::new()));

        let search = Search::new(policy(OnFound::AttachFast, OnNotFound::Create, &env), deps);
        let started = Instant::now();
        let SearchOutcome::Attached(handle) = search.run().await.unwrap() else {
            panic!("expected attach");
        };
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(handle.holder(), Some(InstanceId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_slow_candidate_is_dropped() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(Arc::new(MemoryStore::new()), env.clone());
        advertise(&deps, 2, PresenceRecord::new(NOW, &deps.origin, Some("esh-2".into()), None));

        let search = Search::new(policy(OnFound::Abort, OnNotFound::Create, &env), deps.clone());
        let started = Instant::now();
        assert!(matches!(search.run().await.unwrap(), SearchOutcome::Create));
        assert_eq!(started.elapsed(), deps.timings.heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeating_slow_candidate_is_confirmed() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(Arc::new(MemoryStore::new()), env.clone());
        advertise(&deps, 2, PresenceRecord::new(NOW, &deps.origin, Some("esh-2".into()), None));

        let writer = deps.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            advertise(&writer, 2, PresenceRecord::new(NOW + 500, &writer.origin, Some("esh-2".into()), None));
        });

        let search = Search::new(policy(OnFound::Abort, OnNotFound::Create, &env), deps);
        assert!(matches!(search.run().await.unwrap(), SearchOutcome::Fail));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attach_blacklists_and_moves_on() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(Arc::new(MemoryStore::new()), env.clone());
        // advertises a relay that does not exist and no direct reference
        advertise(&deps, 2, PresenceRecord::new(NOW, &deps.origin, None, Some("esh-relay-2".into())));

        let search = Search::new(policy(OnFound::Attach, OnNotFound::Create, &env), deps);
        assert!(matches!(search.run().await.unwrap(), SearchOutcome::Create));
        assert!(search.is_checked(InstanceId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn local_only_looks_in_directory() {
        let env = Arc::new(LocalEnvironment::new());
        let store = Arc::new(MemoryStore::new());
        let deps = deps(store.clone(), env.clone());
        let local = SharingPolicy::new("app1", OnFound::Attach, OnNotFound::Create, true, env.as_ref()).unwrap();

        let search = Search::new(local.clone(), deps.clone());
        assert!(matches!(search.run().await.unwrap(), SearchOutcome::Create));

        deps.directory.register_engine(InstanceId(9), Arc::new(RecordingEngine::new()));
        deps.directory.register_presence(&ns(), InstanceId(9));
        let SearchOutcome::Attached(handle) = Search::new(local, deps).run().await.unwrap() else {
            panic!("expected attach");
        };
        assert!(!handle.is_remote());
        assert_eq!(store.read_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_keeps_looking_until_cancelled() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(Arc::new(MemoryStore::new()), env.clone());
        let search = Search::new(policy(OnFound::Attach, OnNotFound::Wait, &env), deps);

        let running = search.clone();
        let task = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!task.is_finished());

        search.cancel();
        assert!(matches!(task.await.unwrap(), Err(SharingError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn preferred_target_without_record_is_blacklisted() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(Arc::new(MemoryStore::new()), env.clone());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let peer = PeerRef::new(tx).with_holder(InstanceId(3), ns());

        let search = Search::new(
            policy(OnFound::Abort, OnNotFound::Create, &env).with_preferred_target(peer),
            deps,
        );
        assert!(matches!(search.run().await.unwrap(), SearchOutcome::Create));
        assert!(search.is_checked(InstanceId(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn live_preferred_target_is_found_first() {
        let env = Arc::new(LocalEnvironment::new());
        let deps = deps(Arc::new(MemoryStore::new()), env.clone());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let peer = PeerRef::new(tx).with_holder(InstanceId(3), ns());
        // not in the id list, only reachable through the reference
        deps.status
            .write_shared_status(InstanceId(3), &ns(), &PresenceRecord::new(NOW, &deps.origin, Some("esh-3".into()), None));

        let search = Search::new(
            policy(OnFound::Abort, OnNotFound::Create, &env).with_preferred_target(peer),
            deps,
        );
        let started = Instant::now();
        assert!(matches!(search.run().await.unwrap(), SearchOutcome::Fail));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
