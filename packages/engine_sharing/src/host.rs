//! Holder side of a shared engine.
//!
//! An [`EngineHost`] listens on up to two bridges: a relay hub it owns
//! when the environment can run one, and a direct bridge published under
//! the instance's peer name. Every remote that joins gets its own RPC
//! channel served by an [`EngineDispatcher`], and every engine event is
//! pushed to all of them as `onEvent`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeEvent, BridgeKind, BridgeRole, DirectBridge, RelayBridge};
use crate::engine::{EngineDispatcher, EngineEvent, ON_EVENT, SessionEngine};
use crate::rpc::RemoteChannel;
use crate::sharing::SharingDeps;
use crate::types::{InstanceId, Namespace, PeerId};

/// Where remotes can reach a host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostAddresses {
    pub direct: Option<String>,
    pub worker: Option<String>,
}

impl HostAddresses {
    /// The `(direct, worker)` pair to put in a presence record. A record
    /// carries one meaningful address; the relay wins when there is one.
    pub fn advertised(&self) -> (Option<String>, Option<String>) {
        match &self.worker {
            Some(worker) => (None, Some(worker.clone())),
            None => (self.direct.clone(), None),
        }
    }
}

struct HostInner {
    id: InstanceId,
    engine: Arc<dyn SessionEngine>,
    deps: SharingDeps,
    direct: Option<DirectBridge>,
    relay: Mutex<Option<RelayBridge>>,
    remotes: Mutex<HashMap<(BridgeKind, PeerId), RemoteChannel>>,
    addresses: watch::Sender<HostAddresses>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

#[derive(Clone)]
pub struct EngineHost {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for EngineHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHost")
            .field("id", &self.inner.id)
            .field("addresses", &*self.inner.addresses.borrow())
            .field("remotes", &self.remote_count())
            .finish()
    }
}

impl EngineHost {
    /// Register `engine` and open its bridges. Must be called inside a
    /// tokio runtime.
    pub fn start(
        id: InstanceId,
        namespace: &Namespace,
        engine: Arc<dyn SessionEngine>,
        deps: &SharingDeps,
    ) -> Self {
        let env = &deps.env;
        deps.directory.register_engine(id, engine.clone());

        let mut addresses = HostAddresses::default();
        let mut relay = None;
        if env.relay_supported() {
            let address = id.relay_address();
            match env.open_relay(&address) {
                Some(hub) => {
                    relay = Some(RelayBridge::connect(hub));
                    addresses.worker = Some(address);
                }
                None => warn!(%id, address, "relay unavailable, advertising direct address"),
            }
        }

        let mut direct = None;
        if env.can_hold_references() {
            let (bridge, events) = DirectBridge::master();
            let name = id.peer_name();
            if env.publish(&name, bridge.peer_ref().with_holder(id, namespace.clone())) {
                addresses.direct = Some(name);
                direct = Some((bridge, events));
            } else {
                warn!(%id, name, "peer name already taken, no direct bridge");
                bridge.dispose();
            }
        }

        let (addresses_tx, _) = watch::channel(addresses);
        let host = Self {
            inner: Arc::new(HostInner {
                id,
                engine: engine.clone(),
                deps: deps.clone(),
                direct: direct.as_ref().map(|(bridge, _)| bridge.clone()),
                relay: Mutex::new(relay.as_ref().map(|(bridge, _)| bridge.clone())),
                remotes: Mutex::new(HashMap::new()),
                addresses: addresses_tx,
                cancel: CancellationToken::new(),
                disposed: AtomicBool::new(false),
            }),
        };

        if let Some((bridge, events)) = relay {
            tokio::spawn(host.clone().serve(bridge.into(), events));
        }
        if let Some((bridge, events)) = direct {
            tokio::spawn(host.clone().serve(bridge.into(), events));
        }
        tokio::spawn(host.clone().fan_out(engine.events()));

        info!(%id, namespace = %namespace, addresses = ?host.addresses(), "engine host started");
        host
    }

    pub fn id(&self) -> InstanceId {
        self.inner.id
    }

    pub fn addresses(&self) -> HostAddresses {
        self.inner.addresses.borrow().clone()
    }

    /// Notified whenever the reachable addresses change.
    pub fn watch_addresses(&self) -> watch::Receiver<HostAddresses> {
        self.inner.addresses.subscribe()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Resolves once the host was disposed.
    pub async fn disposed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Drop every remote and give up the addresses. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let channels: Vec<RemoteChannel> = self.remotes().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close();
        }

        let env = &self.inner.deps.env;
        if let Some(direct) = &self.inner.direct {
            direct.dispose();
            env.withdraw(&self.inner.id.peer_name());
        }
        let relay = self.relay().take();
        if let Some(relay) = relay {
            relay.dispose();
            env.close_relay(relay.address());
        }
        self.inner.deps.directory.remove_engine(self.inner.id);
        info!(id = %self.inner.id, "engine host disposed");
    }

    async fn serve(self, bridge: Bridge, mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle(&bridge, event) {
                        break;
                    }
                }
            }
        }
    }

    /// Returns false once the bridge is gone for good.
    fn handle(&self, bridge: &Bridge, event: BridgeEvent) -> bool {
        let kind = bridge.kind();
        match event {
            BridgeEvent::Ready { role, id } => {
                if role != BridgeRole::Master {
                    warn!(host = %self.inner.id, ?kind, %id, "host bridge is not master");
                    if kind == BridgeKind::Relay {
                        self.relay_lost();
                        return false;
                    }
                }
                debug!(host = %self.inner.id, ?kind, "host bridge ready");
            }
            BridgeEvent::Remote(peer) => {
                let channel = RemoteChannel::new(
                    self.inner.deps.directory.next_channel_id(),
                    bridge.clone(),
                    peer,
                    Arc::new(EngineDispatcher::new(self.inner.engine.clone())),
                    self.inner.deps.timings.call_timeout,
                );
                channel.set_ready();
                self.remotes().insert((kind, peer), channel);
                info!(host = %self.inner.id, ?kind, %peer, "remote attached");
            }
            BridgeEvent::Message(msg) => {
                let channel = self.remotes().get(&(kind, msg.sender)).cloned();
                match channel {
                    Some(channel) => channel.on_message(msg),
                    None => debug!(host = %self.inner.id, sender = %msg.sender, "message from unknown remote"),
                }
            }
            BridgeEvent::MessageFail { target, message_id } => {
                let channel = self.remotes().get(&(kind, target)).cloned();
                if let Some(channel) = channel {
                    channel.on_message_fail(&message_id);
                }
            }
            BridgeEvent::Terminated { peer } if peer.is_master() && kind == BridgeKind::Relay => {
                self.relay_lost();
                return false;
            }
            BridgeEvent::Terminated { peer } => {
                let channel = self.remotes().remove(&(kind, peer));
                if let Some(channel) = channel {
                    channel.close();
                    info!(host = %self.inner.id, ?kind, %peer, "remote detached");
                }
            }
        }
        true
    }

    /// The relay died under us: keep serving on the direct bridge only.
    fn relay_lost(&self) {
        let Some(relay) = self.relay().take() else {
            return;
        };
        warn!(host = %self.inner.id, address = relay.address(), "relay lost");
        relay.dispose();
        self.inner.deps.env.close_relay(relay.address());

        let channels: Vec<RemoteChannel> = {
            let mut remotes = self.remotes();
            let keys: Vec<_> = remotes
                .keys()
                .filter(|(kind, _)| *kind == BridgeKind::Relay)
                .copied()
                .collect();
            keys.iter().filter_map(|key| remotes.remove(key)).collect()
        };
        for channel in channels {
            channel.close();
        }

        self.inner.addresses.send_modify(|addresses| addresses.worker = None);
    }

    async fn fan_out(self, mut events: broadcast::Receiver<EngineEvent>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.push(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(host = %self.inner.id, skipped = n, "host lagging behind engine events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    fn push(&self, event: &EngineEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode engine event");
                return;
            }
        };
        let channels: Vec<RemoteChannel> = self.remotes().values().cloned().collect();
        for channel in channels {
            if let Some(Err(e)) = channel.call_defined(&ON_EVENT, vec![payload.clone()]).now_or_never() {
                debug!(target = %channel.target(), error = %e, "event not delivered");
            }
        }
    }

    fn remotes(&self) -> MutexGuard<'_, HashMap<(BridgeKind, PeerId), RemoteChannel>> {
        self.inner.remotes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn relay(&self) -> MutexGuard<'_, Option<RelayBridge>> {
        self.inner.relay.lock().unwrap_or_else(|e| e.into_inner())
    }
}
