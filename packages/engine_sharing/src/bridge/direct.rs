use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BridgeEvent, BridgeRole};
use crate::types::{InstanceId, Namespace, PeerId};
use crate::wire::{MessageType, WireMessage};

/// Bytes dropped into a context's inbox, plus the sender's own reference
/// when it wants to be answered directly (connect handshake).
#[derive(Debug)]
pub struct Envelope {
    pub bytes: Vec<u8>,
    pub reply_to: Option<PeerRef>,
}

/// Live reference to another context's direct bridge.
#[derive(Clone, Debug)]
pub struct PeerRef {
    inbox: mpsc::UnboundedSender<Envelope>,
    holder: Option<(InstanceId, Namespace)>,
}

impl PeerRef {
    pub fn new(inbox: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            inbox,
            holder: None,
        }
    }

    /// Tag the reference with the instance advertising through it.
    pub fn with_holder(mut self, id: InstanceId, namespace: Namespace) -> Self {
        self.holder = Some((id, namespace));
        self
    }

    pub fn holder(&self) -> Option<(InstanceId, &Namespace)> {
        self.holder.as_ref().map(|(id, ns)| (*id, ns))
    }

    /// False once the owning context stopped listening.
    pub fn is_alive(&self) -> bool {
        !self.inbox.is_closed()
    }

    fn deliver(&self, envelope: Envelope) -> bool {
        self.inbox.send(envelope).is_ok()
    }
}

#[derive(Debug)]
struct DirectState {
    role: Option<BridgeRole>,
    id: Option<PeerId>,
    peers: HashMap<PeerId, PeerRef>,
    next_remote: u64,
    disposed: bool,
}

#[derive(Debug)]
struct Outbound {
    target: PeerId,
    message_id: String,
    bytes: Vec<u8>,
    reply_to: Option<PeerRef>,
}

#[derive(Debug)]
struct DirectInner {
    state: Mutex<DirectState>,
    own: PeerRef,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    cancel: CancellationToken,
}

/// Bridge between contexts holding live references to each other.
///
/// The context started without a peer is the master and hands out
/// sequential ids to every peer connecting through [`DirectBridge::peer_ref`].
/// Deliveries go through a writer task, never inline, in queue order.
#[derive(Clone, Debug)]
pub struct DirectBridge {
    inner: Arc<DirectInner>,
}

impl DirectBridge {
    /// Master when `peer` is `None`, otherwise a remote of the master
    /// behind `peer`.
    pub fn start(peer: Option<PeerRef>) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let bridge = Self {
            inner: Arc::new(DirectInner {
                state: Mutex::new(DirectState {
                    role: None,
                    id: None,
                    peers: HashMap::new(),
                    next_remote: 1,
                    disposed: false,
                }),
                own: PeerRef::new(inbox_tx),
                outbound: outbound_tx,
                events: events_tx,
                cancel: CancellationToken::new(),
            }),
        };

        tokio::spawn(bridge.clone().read_loop(inbox_rx));
        tokio::spawn(bridge.clone().write_loop(outbound_rx));

        match peer {
            None => {
                {
                    let mut state = bridge.state();
                    state.role = Some(BridgeRole::Master);
                    state.id = Some(PeerId::MASTER);
                }
                bridge.emit(BridgeEvent::Ready {
                    role: BridgeRole::Master,
                    id: PeerId::MASTER,
                });
            }
            Some(master) => {
                {
                    let mut state = bridge.state();
                    state.role = Some(BridgeRole::Remote);
                    state.peers.insert(PeerId::MASTER, master.clone());
                }
                bridge.watch(PeerId::MASTER, master);
                let hello = WireMessage::new(
                    MessageType::Initialization,
                    PeerId::BROADCAST,
                    PeerId::MASTER,
                    "",
                    Vec::new(),
                );
                bridge.queue(hello, Some(bridge.inner.own.clone()));
            }
        }

        (bridge, events_rx)
    }

    pub fn master() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        Self::start(None)
    }

    pub fn connect(master: PeerRef) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        Self::start(Some(master))
    }

    /// Reference other contexts use to connect to this bridge.
    pub fn peer_ref(&self) -> PeerRef {
        self.inner.own.clone()
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state();
        !state.disposed && state.id.is_some()
    }

    pub fn role(&self) -> Option<BridgeRole> {
        self.state().role
    }

    pub fn id(&self) -> Option<PeerId> {
        self.state().id
    }

    pub fn peer_count(&self) -> usize {
        self.state().peers.len()
    }

    pub fn send_message(
        &self,
        target: PeerId,
        kind: MessageType,
        message_id: &str,
        params: Vec<Value>,
    ) -> bool {
        let sender = {
            let state = self.state();
            if state.disposed {
                return false;
            }
            let Some(id) = state.id else {
                return false;
            };
            if target != PeerId::BROADCAST && !state.peers.contains_key(&target) {
                return false;
            }
            id
        };
        let msg = WireMessage::new(kind, sender, target, message_id, params);
        self.queue(msg, None)
    }

    pub fn remove_target(&self, target: PeerId) {
        self.state().peers.remove(&target);
    }

    pub fn dispose(&self) {
        {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.peers.clear();
        }
        self.inner.cancel.cancel();
    }

    fn state(&self) -> MutexGuard<'_, DirectState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.inner.events.send(event);
    }

    fn queue(&self, msg: WireMessage, reply_to: Option<PeerRef>) -> bool {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode bridge message");
                return false;
            }
        };
        self.inner
            .outbound
            .send(Outbound {
                target: msg.target,
                message_id: msg.message_id,
                bytes,
                reply_to,
            })
            .is_ok()
    }

    /// Report `peer` as terminated once its context stops listening.
    fn watch(&self, peer: PeerId, reference: PeerRef) {
        let bridge = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = reference.inbox.closed() => {
                    debug!(%peer, "direct peer went away");
                    bridge.state().peers.remove(&peer);
                    bridge.emit(BridgeEvent::Terminated { peer });
                }
                _ = bridge.inner.cancel.cancelled() => {}
            }
        });
    }

    async fn write_loop(self, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                item = outbound.recv() => {
                    let Some(item) = item else { break };
                    self.deliver(item);
                }
            }
        }
    }

    fn deliver(&self, item: Outbound) {
        let targets: Vec<(PeerId, Option<PeerRef>)> = {
            let state = self.state();
            if item.target == PeerId::BROADCAST {
                state.peers.iter().map(|(id, r)| (*id, Some(r.clone()))).collect()
            } else {
                vec![(item.target, state.peers.get(&item.target).cloned())]
            }
        };

        for (target, reference) in targets {
            let delivered = reference.is_some_and(|r| {
                r.deliver(Envelope {
                    bytes: item.bytes.clone(),
                    reply_to: item.reply_to.clone(),
                })
            });
            if !delivered {
                debug!(%target, message_id = %item.message_id, "direct delivery failed");
                self.emit(BridgeEvent::MessageFail {
                    target,
                    message_id: item.message_id.clone(),
                });
            }
        }
    }

    async fn read_loop(self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.receive(envelope);
                }
            }
        }
    }

    fn receive(&self, envelope: Envelope) {
        let msg = match WireMessage::decode(&envelope.bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping malformed bridge message");
                return;
            }
        };

        if msg.kind != MessageType::Initialization {
            self.emit(BridgeEvent::Message(msg));
            return;
        }

        match self.role() {
            Some(BridgeRole::Master) => {
                let Some(reference) = envelope.reply_to else {
                    warn!("connect request without a reply reference");
                    return;
                };
                let peer = {
                    let mut state = self.state();
                    if state.disposed {
                        return;
                    }
                    let peer = PeerId(state.next_remote);
                    state.next_remote += 1;
                    state.peers.insert(peer, reference.clone());
                    peer
                };
                debug!(%peer, "direct peer connected");
                self.watch(peer, reference);
                let welcome = WireMessage::new(
                    MessageType::Initialization,
                    PeerId::MASTER,
                    peer,
                    "",
                    Vec::new(),
                );
                self.queue(welcome, None);
                self.emit(BridgeEvent::Remote(peer));
            }
            Some(BridgeRole::Remote) => {
                {
                    let mut state = self.state();
                    if state.id.is_some() {
                        return;
                    }
                    state.id = Some(msg.target);
                }
                self.emit(BridgeEvent::Ready {
                    role: BridgeRole::Remote,
                    id: msg.target,
                });
            }
            None => {}
        }
    }
}
