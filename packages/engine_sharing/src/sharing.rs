//! Entry point: run discovery, then either hold the engine or ride on
//! someone else's, and start over whenever that arrangement ends.
//!
//! ```text
//!   start ──► Search ──► Create ──► holder: EngineHost + PresenceEngine
//!                │                        │ suicide
//!                │                        ▼
//!                ├─────► Attached ──► remote handle ──► engine death
//!                │                                           │
//!                └─────► Fail                                ▼
//!                                          Search (election variant)
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::Timings;
use crate::directory::Directory;
use crate::engine::{EngineEvent, EngineHandle, SessionEngine};
use crate::environment::Environment;
use crate::error::SharingError;
use crate::gc::{Collector, CollectorLease};
use crate::host::EngineHost;
use crate::policy::{OnFound, SharingPolicy};
use crate::presence::{PresenceEngine, PresenceMode, Withdrawal};
use crate::search::{Search, SearchOutcome};
use crate::store::SharedStore;
use crate::store::status::{Origin, StatusStore};
use crate::types::InstanceId;

/// Everything one context lends to its sharing instances.
#[derive(Clone, Debug)]
pub struct SharingDeps {
    pub status: StatusStore,
    pub env: Arc<dyn Environment>,
    pub directory: Arc<Directory>,
    pub clock: SharedClock,
    pub timings: Timings,
    pub origin: Origin,
    pub collector: Collector,
}

impl SharingDeps {
    pub fn new(
        store: Arc<dyn SharedStore>,
        env: Arc<dyn Environment>,
        directory: Arc<Directory>,
        origin: Origin,
    ) -> Self {
        let status = StatusStore::new(store);
        let clock: SharedClock = Arc::new(SystemClock);
        let timings = Timings::default();
        let collector = Collector::new(status.clone(), clock.clone(), timings);
        Self {
            status,
            env,
            directory,
            clock,
            timings,
            origin,
            collector,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self.rebuild_collector();
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self.rebuild_collector();
        self
    }

    fn rebuild_collector(&mut self) {
        self.collector = Collector::new(self.status.clone(), self.clock.clone(), self.timings);
    }
}

/// What happened to an [`EngineSharing`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SharingEvent {
    /// This instance holds the engine.
    Holder { id: InstanceId },
    Attached { holder: Option<InstanceId> },
    /// The previous arrangement ended; discovery runs again.
    Lost { reason: String },
    /// Discovery ended without a handle.
    Failed,
}

enum Role {
    Idle,
    Holder {
        presence: PresenceEngine,
        host: Option<EngineHost>,
        _lease: Option<CollectorLease>,
        stop: CancellationToken,
    },
    Attached {
        handle: EngineHandle,
        stop: CancellationToken,
    },
}

struct SharingState {
    role: Role,
    current: Option<EngineHandle>,
    search: Option<Search>,
    generation: u64,
    disposed: bool,
}

struct SharingInner {
    policy: SharingPolicy,
    deps: SharingDeps,
    engine: Arc<dyn SessionEngine>,
    events: broadcast::Sender<SharingEvent>,
    state: Mutex<SharingState>,
}

/// One sharing instance around a local engine.
#[derive(Clone)]
pub struct EngineSharing {
    inner: Arc<SharingInner>,
}

impl std::fmt::Debug for EngineSharing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSharing")
            .field("namespace", self.inner.policy.namespace())
            .field("current", &self.current())
            .finish()
    }
}

impl EngineSharing {
    pub fn new(policy: SharingPolicy, deps: SharingDeps, engine: Arc<dyn SessionEngine>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SharingInner {
                policy,
                deps,
                engine,
                events,
                state: Mutex::new(SharingState {
                    role: Role::Idle,
                    current: None,
                    search: None,
                    generation: 0,
                    disposed: false,
                }),
            }),
        }
    }

    /// Run discovery and return the handle to use. Later changes of
    /// holder are reported through [`Self::subscribe`] and picked up with
    /// [`Self::current`].
    pub async fn start(&self) -> Result<EngineHandle, SharingError> {
        self.establish(self.inner.policy.clone(), HashSet::new()).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SharingEvent> {
        self.inner.events.subscribe()
    }

    /// The handle currently in use, if any.
    pub fn current(&self) -> Option<EngineHandle> {
        self.state().current.clone()
    }

    /// Whether this instance currently holds the engine.
    pub fn is_holder(&self) -> bool {
        matches!(self.state().role, Role::Holder { .. })
    }

    /// Withdraw and drop whatever this instance holds or is attached to.
    pub fn dispose(&self) {
        let (role, search) = {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.generation += 1;
            state.current = None;
            (std::mem::replace(&mut state.role, Role::Idle), state.search.take())
        };
        if let Some(search) = search {
            search.cancel();
        }
        end_role(role);
        info!(namespace = %self.inner.policy.namespace(), "sharing disposed");
    }

    /// Discover and adopt the outcome. `dont_die_for` is handed to the
    /// presence if we end up holding.
    fn establish(
        &self,
        policy: SharingPolicy,
        dont_die_for: HashSet<InstanceId>,
    ) -> BoxFuture<'static, Result<EngineHandle, SharingError>> {
        let this = self.clone();
        async move {
            let search = Search::new(policy.clone(), this.inner.deps.clone()).with_blacklist(dont_die_for.iter().copied());
            let generation = {
                let mut state = this.state();
                if state.disposed {
                    return Err(SharingError::Cancelled);
                }
                state.generation += 1;
                if let Some(previous) = state.search.replace(search.clone()) {
                    previous.cancel();
                }
                state.generation
            };

            let outcome = search.run().await;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!(namespace = %policy.namespace(), error = %e, "discovery ended");
                    return Err(e);
                }
            };

            match outcome {
                SearchOutcome::Attached(handle) => this.adopt_attached(generation, handle),
                SearchOutcome::Create => this.become_holder(generation, &policy, dont_die_for),
                SearchOutcome::Fail => {
                    info!(namespace = %policy.namespace(), "sharing aborted by policy");
                    let _ = this.inner.events.send(SharingEvent::Failed);
                    Err(SharingError::Aborted)
                }
            }
        }
        .boxed()
    }

    fn adopt_attached(&self, generation: u64, handle: EngineHandle) -> Result<EngineHandle, SharingError> {
        let stop = CancellationToken::new();
        let old = {
            let mut state = self.state();
            if state.disposed || state.generation != generation {
                drop(state);
                handle.close();
                return Err(SharingError::Cancelled);
            }
            state.search = None;
            state.current = Some(handle.clone());
            std::mem::replace(
                &mut state.role,
                Role::Attached {
                    handle: handle.clone(),
                    stop: stop.clone(),
                },
            )
        };
        end_role(old);

        info!(namespace = %self.inner.policy.namespace(), holder = ?handle.holder(), remote = handle.is_remote(), "attached");
        let _ = self.inner.events.send(SharingEvent::Attached {
            holder: handle.holder(),
        });
        tokio::spawn(self.clone().watch_holder(generation, handle.clone(), stop));
        Ok(handle)
    }

    fn become_holder(
        &self,
        generation: u64,
        policy: &SharingPolicy,
        dont_die_for: HashSet<InstanceId>,
    ) -> Result<EngineHandle, SharingError> {
        let deps = &self.inner.deps;
        let namespace = policy.namespace();
        let engine = self.inner.engine.clone();

        if self.state().disposed {
            return Err(SharingError::Cancelled);
        }

        let id = deps.directory.allocate_id(deps.env.as_ref());
        let presence = PresenceEngine::new(id, namespace.clone(), deps);
        presence.set_dont_die_for(dont_die_for);
        let stop = CancellationToken::new();

        let (host, lease, withdrawal) = if policy.local_only() {
            deps.directory.register_engine(id, engine.clone());
            let directory = deps.directory.clone();
            presence.set_release(move || directory.remove_engine(id));
            (None, None, presence.start(PresenceMode::LocalOnly))
        } else {
            let host = EngineHost::start(id, namespace, engine.clone(), deps);
            let (direct, worker) = host.addresses().advertised();
            presence.change_addresses(direct, worker);
            let released = host.clone();
            presence.set_release(move || released.dispose());
            let compare = policy.on_found() != OnFound::Ignore;
            let withdrawal = presence.start(PresenceMode::CrossContext { compare });
            tokio::spawn(follow_addresses(host.clone(), presence.clone(), stop.clone()));
            (Some(host), Some(deps.collector.acquire()), withdrawal)
        };

        let handle = EngineHandle::local(engine, Some(id));
        let old = {
            let mut state = self.state();
            if state.disposed || state.generation != generation {
                drop(state);
                presence.dispose();
                stop.cancel();
                return Err(SharingError::Cancelled);
            }
            state.search = None;
            state.current = Some(handle.clone());
            std::mem::replace(
                &mut state.role,
                Role::Holder {
                    presence,
                    host,
                    _lease: lease,
                    stop,
                },
            )
        };
        end_role(old);

        info!(namespace = %namespace, %id, "holding the engine");
        let _ = self.inner.events.send(SharingEvent::Holder { id });
        tokio::spawn(self.clone().watch_withdrawal(generation, withdrawal));
        Ok(handle)
    }

    /// Our presence ended. After a lost election, look again.
    async fn watch_withdrawal(self, generation: u64, withdrawal: oneshot::Receiver<Withdrawal>) {
        let Ok(Withdrawal::Suicide { winner }) = withdrawal.await else {
            return;
        };
        if !self.retire(generation) {
            return;
        }
        let reason = format!("lost election to {}", winner);
        let _ = self.inner.events.send(SharingEvent::Lost { reason });
        self.restart(self.inner.policy.election_variant(), HashSet::new())
            .await;
    }

    /// Wait for the holder behind `handle` to die, then look again
    /// without it.
    async fn watch_holder(self, generation: u64, handle: EngineHandle, stop: CancellationToken) {
        let mut events = handle.subscribe_events();
        let reason = loop {
            if handle.is_dead() {
                break "holder gone".to_string();
            }
            tokio::select! {
                _ = stop.cancelled() => return,
                event = events.recv() => match event {
                    Ok(EngineEvent::EngineDeath { reason }) => break reason,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };
        if !self.retire(generation) {
            return;
        }
        warn!(namespace = %self.inner.policy.namespace(), holder = ?handle.holder(), reason = %reason, "holder died");
        let _ = self.inner.events.send(SharingEvent::Lost { reason });
        let dead: HashSet<InstanceId> = handle.holder().into_iter().collect();
        self.restart(self.inner.policy.election_variant(), dead).await;
    }

    /// End the role of `generation` if it is still current.
    fn retire(&self, generation: u64) -> bool {
        let role = {
            let mut state = self.state();
            if state.disposed || state.generation != generation {
                return false;
            }
            state.current = None;
            std::mem::replace(&mut state.role, Role::Idle)
        };
        end_role(role);
        true
    }

    async fn restart(&self, policy: SharingPolicy, dont_die_for: HashSet<InstanceId>) {
        match self.establish(policy, dont_die_for).await {
            Ok(_) => {}
            Err(SharingError::Cancelled) => debug!("rediscovery cancelled"),
            Err(SharingError::Aborted) => {}
            Err(e) => {
                error!(error = %e, "rediscovery failed");
                let _ = self.inner.events.send(SharingEvent::Failed);
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, SharingState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn end_role(role: Role) {
    match role {
        Role::Idle => {}
        Role::Holder {
            presence,
            host,
            stop,
            ..
        } => {
            stop.cancel();
            presence.dispose();
            if let Some(host) = host {
                host.dispose();
            }
        }
        Role::Attached { handle, stop } => {
            stop.cancel();
            handle.close();
        }
    }
}

/// Keep the presence record pointing at addresses the host still serves.
async fn follow_addresses(host: EngineHost, presence: PresenceEngine, stop: CancellationToken) {
    let mut addresses = host.watch_addresses();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = host.disposed() => break,
            changed = addresses.changed() => {
                if changed.is_err() {
                    break;
                }
                let (direct, worker) = addresses.borrow_and_update().advertised();
                info!(id = %host.id(), ?direct, ?worker, "advertised address changed");
                presence.change_addresses(direct, worker);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::engine::RecordingEngine;
    use crate::environment::LocalEnvironment;
    use crate::policy::OnNotFound;
    use crate::store::MemoryStore;
    use crate::types::Namespace;
    use std::time::Duration;

    fn deps(store: &Arc<MemoryStore>, env: &Arc<LocalEnvironment>, first_id: u64) -> SharingDeps {
        SharingDeps::new(
            store.clone(),
            env.clone(),
            Arc::new(Directory::starting_at(first_id)),
            Origin::new("h", "b1", "https"),
        )
        .with_clock(Arc::new(TokioClock::starting_at(1_000_000)))
    }

    #[tokio::test(start_paused = true)]
    async fn first_instance_holds_second_attaches() {
        let store = Arc::new(MemoryStore::new());
        let env = Arc::new(LocalEnvironment::new());
        let policy = SharingPolicy::new("app1", OnFound::Attach, OnNotFound::Create, false, env.as_ref()).unwrap();

        let first = EngineSharing::new(policy.clone(), deps(&store, &env, 100), Arc::new(RecordingEngine::new()));
        let handle = first.start().await.unwrap();
        assert!(!handle.is_remote());
        assert!(first.is_holder());
        tokio::time::sleep(Duration::from_millis(500)).await;

        let second = EngineSharing::new(policy, deps(&store, &env, 200), Arc::new(RecordingEngine::new()));
        let attached = second.start().await.unwrap();
        assert!(attached.is_remote());
        assert_eq!(attached.holder(), handle.holder());
        assert!(!second.is_holder());

        first.dispose();
        second.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn holder_death_promotes_the_attached_instance() {
        let store = Arc::new(MemoryStore::new());
        let env = Arc::new(LocalEnvironment::new());
        let policy = SharingPolicy::new("app1", OnFound::Attach, OnNotFound::Create, false, env.as_ref()).unwrap();

        let first = EngineSharing::new(policy.clone(), deps(&store, &env, 100), Arc::new(RecordingEngine::new()));
        first.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = EngineSharing::new(policy, deps(&store, &env, 200), Arc::new(RecordingEngine::new()));
        let mut events = second.subscribe();
        second.start().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), SharingEvent::Attached { .. }));

        first.dispose();
        assert!(matches!(events.recv().await.unwrap(), SharingEvent::Lost { .. }));
        assert!(matches!(events.recv().await.unwrap(), SharingEvent::Holder { .. }));
        assert!(second.is_holder());
        assert!(!second.current().unwrap().is_remote());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_policy_reports_failure() {
        let store = Arc::new(MemoryStore::new());
        let env = Arc::new(LocalEnvironment::new());
        let holder_policy = SharingPolicy::new("app1", OnFound::Ignore, OnNotFound::Create, false, env.as_ref()).unwrap();
        let holder = EngineSharing::new(holder_policy, deps(&store, &env, 100), Arc::new(RecordingEngine::new()));
        holder.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let policy = SharingPolicy::new("app1", OnFound::Abort, OnNotFound::Create, false, env.as_ref()).unwrap();
        let other = EngineSharing::new(policy, deps(&store, &env, 200), Arc::new(RecordingEngine::new()));
        let mut events = other.subscribe();
        assert!(matches!(other.start().await, Err(SharingError::Aborted)));
        assert_eq!(events.recv().await.unwrap(), SharingEvent::Failed);
        assert!(other.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn local_only_shares_within_the_context() {
        let store = Arc::new(MemoryStore::new());
        let env = Arc::new(LocalEnvironment::isolated());
        let context = deps(&store, &env, 1);
        let policy = SharingPolicy::new("app1", OnFound::Attach, OnNotFound::Create, true, env.as_ref()).unwrap();

        let first = EngineSharing::new(policy.clone(), context.clone(), Arc::new(RecordingEngine::new()));
        let held = first.start().await.unwrap();
        let second = EngineSharing::new(policy, context.clone(), Arc::new(RecordingEngine::new()));
        let attached = second.start().await.unwrap();
        assert_eq!(attached.holder(), held.holder());
        assert!(!attached.is_remote());
        assert_eq!(store.read_count(), 0);

        first.dispose();
        assert!(context.directory.lookup(&Namespace::new("app1").unwrap()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cleans_the_store() {
        let store = Arc::new(MemoryStore::new());
        let env = Arc::new(LocalEnvironment::new());
        let context = deps(&store, &env, 1);
        let policy = SharingPolicy::new("app1", OnFound::Attach, OnNotFound::Create, false, env.as_ref()).unwrap();
        let sharing = EngineSharing::new(policy, context.clone(), Arc::new(RecordingEngine::new()));
        sharing.start().await.unwrap();
        assert!(context.collector.is_running());
        tokio::time::sleep(Duration::from_secs(3)).await;

        sharing.dispose();
        sharing.dispose();
        assert!(context.status.get_all_keys().is_empty());
        assert!(!context.collector.is_running());
        assert!(env.find_relay("esh-relay-1").is_none());
    }
}
