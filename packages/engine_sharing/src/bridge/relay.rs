//! Relay transport: every peer talks to one always-on hub which routes
//! messages by peer id.
//!
//! The hub is a small actor. The first connector is the master; later
//! connectors get sequential remote ids and the master is told about each
//! of them with `REMOTE`. When a remote leaves the master gets `REMOVE`;
//! when the master leaves (or sends `KILL`) every peer gets `KILL` and the
//! hub stops.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BridgeEvent, BridgeRole};
use crate::types::PeerId;
use crate::wire::{MessageType, WireMessage};

#[derive(Debug)]
enum HubCommand {
    Connect { port: mpsc::UnboundedSender<Vec<u8>> },
    Deliver { bytes: Vec<u8> },
    Disconnect { peer: PeerId },
}

/// Handle to a running relay hub.
#[derive(Clone, Debug)]
pub struct RelayHub {
    address: Arc<str>,
    commands: mpsc::UnboundedSender<HubCommand>,
    cancel: CancellationToken,
}

impl RelayHub {
    /// Start a hub task. Must be called inside a tokio runtime.
    pub fn spawn(address: &str) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let hub = Hub {
            address: address.to_string(),
            peers: BTreeMap::new(),
            next_remote: 1,
            has_master: false,
        };
        tokio::spawn(hub.run(rx, cancel.clone()));
        info!(address, "relay hub started");
        Self {
            address: address.into(),
            commands,
            cancel,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.commands.is_closed()
    }

    /// Resolves once the hub has stopped.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Kill every peer and stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn send(&self, command: HubCommand) -> bool {
        !self.cancel.is_cancelled() && self.commands.send(command).is_ok()
    }
}

struct Hub {
    address: String,
    peers: BTreeMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>,
    next_remote: u64,
    has_master: bool,
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.kill_all();
                    break;
                }
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command) {
                        break;
                    }
                }
            }
        }
        cancel.cancel();
        info!(address = %self.address, "relay hub stopped");
    }

    /// Returns false when the hub must stop.
    fn handle(&mut self, command: HubCommand) -> bool {
        match command {
            HubCommand::Connect { port } => {
                let peer = if self.has_master {
                    let peer = PeerId(self.next_remote);
                    self.next_remote += 1;
                    peer
                } else {
                    self.has_master = true;
                    PeerId::MASTER
                };
                self.peers.insert(peer, port);
                debug!(address = %self.address, %peer, "relay peer connected");
                self.send_to(peer, MessageType::Initialization, "", Vec::new());
                if !peer.is_master() {
                    self.send_to(PeerId::MASTER, MessageType::Remote, "", vec![json!(peer.0)]);
                }
                true
            }
            HubCommand::Disconnect { peer } => self.drop_peer(peer),
            HubCommand::Deliver { bytes } => {
                let msg = match WireMessage::decode(&bytes) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(address = %self.address, error = %e, "relay dropping malformed message");
                        return true;
                    }
                };
                match msg.kind {
                    MessageType::Kill if msg.sender.is_master() => {
                        self.kill_all();
                        false
                    }
                    MessageType::Remove => {
                        let target = msg.target;
                        self.send_to(target, MessageType::Kill, "", Vec::new());
                        self.peers.remove(&target);
                        if target.is_master() {
                            self.kill_all();
                            return false;
                        }
                        true
                    }
                    _ => self.route(msg, bytes),
                }
            }
        }
    }

    fn route(&mut self, msg: WireMessage, bytes: Vec<u8>) -> bool {
        if msg.target == PeerId::BROADCAST {
            for (peer, port) in &self.peers {
                if *peer != msg.sender {
                    let _ = port.send(bytes.clone());
                }
            }
            return true;
        }

        let delivered = self
            .peers
            .get(&msg.target)
            .is_some_and(|port| port.send(bytes).is_ok());
        if delivered {
            return true;
        }

        debug!(address = %self.address, target = %msg.target, message_id = %msg.message_id, "relay delivery failed");
        self.send_to(
            msg.sender,
            MessageType::Failed,
            &msg.message_id,
            vec![json!(msg.target.0)],
        );
        if self.peers.contains_key(&msg.target) {
            return self.drop_peer(msg.target);
        }
        true
    }

    fn drop_peer(&mut self, peer: PeerId) -> bool {
        if self.peers.remove(&peer).is_none() {
            return true;
        }
        debug!(address = %self.address, %peer, "relay peer left");
        if peer.is_master() {
            self.kill_all();
            return false;
        }
        self.send_to(PeerId::MASTER, MessageType::Remove, "", vec![json!(peer.0)]);
        true
    }

    fn kill_all(&mut self) {
        let peers: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peers {
            self.send_to(peer, MessageType::Kill, "", Vec::new());
        }
        self.peers.clear();
    }

    fn send_to(&self, target: PeerId, kind: MessageType, message_id: &str, params: Vec<Value>) -> bool {
        let Some(port) = self.peers.get(&target) else {
            return false;
        };
        match WireMessage::new(kind, PeerId::MASTER, target, message_id, params).encode() {
            Ok(bytes) => port.send(bytes).is_ok(),
            Err(e) => {
                warn!(error = %e, "relay failed to encode control message");
                false
            }
        }
    }
}

#[derive(Debug)]
struct RelayState {
    id: Option<PeerId>,
    disposed: bool,
}

#[derive(Debug)]
struct RelayInner {
    hub: RelayHub,
    state: Mutex<RelayState>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    cancel: CancellationToken,
}

/// Peer side of a [`RelayHub`].
#[derive(Clone, Debug)]
pub struct RelayBridge {
    inner: Arc<RelayInner>,
}

impl RelayBridge {
    pub fn connect(hub: RelayHub) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (port_tx, port_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bridge = Self {
            inner: Arc::new(RelayInner {
                hub,
                state: Mutex::new(RelayState {
                    id: None,
                    disposed: false,
                }),
                events: events_tx,
                cancel: CancellationToken::new(),
            }),
        };

        if bridge.inner.hub.send(HubCommand::Connect { port: port_tx }) {
            tokio::spawn(bridge.clone().read_loop(port_rx));
        } else {
            warn!(address = %bridge.inner.hub.address(), "relay hub is gone");
            bridge.emit(BridgeEvent::Terminated {
                peer: PeerId::MASTER,
            });
        }
        (bridge, events_rx)
    }

    pub fn address(&self) -> &str {
        self.inner.hub.address()
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state();
        !state.disposed && state.id.is_some()
    }

    pub fn role(&self) -> Option<BridgeRole> {
        self.state().id.map(|id| {
            if id.is_master() {
                BridgeRole::Master
            } else {
                BridgeRole::Remote
            }
        })
    }

    pub fn id(&self) -> Option<PeerId> {
        self.state().id
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
            match state.id {
                Some(id) if !state.disposed => id,
                _ => return false,
            }
        };
        match WireMessage::new(kind, sender, target, message_id, params).encode() {
            Ok(bytes) => self.inner.hub.send(HubCommand::Deliver { bytes }),
            Err(e) => {
                warn!(error = %e, "failed to encode relay message");
                false
            }
        }
    }

    /// Ask the hub to drop `target`; it receives `KILL`.
    pub fn remove_target(&self, target: PeerId) {
        self.send_message(target, MessageType::Remove, "", Vec::new());
    }

    pub fn dispose(&self) {
        let id = {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.id
        };
        if let Some(peer) = id {
            self.inner.hub.send(HubCommand::Disconnect { peer });
        }
        self.inner.cancel.cancel();
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn read_loop(self, mut port: mpsc::UnboundedReceiver<Vec<u8>>) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                bytes = port.recv() => {
                    let Some(bytes) = bytes else {
                        if !self.state().disposed {
                            self.emit(BridgeEvent::Terminated { peer: PeerId::MASTER });
                        }
                        break;
                    };
                    if !self.receive(&bytes) {
                        break;
                    }
                }
            }
        }
    }

    /// Returns false once the hub killed us.
    fn receive(&self, bytes: &[u8]) -> bool {
        let msg = match WireMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(address = %self.address(), error = %e, "dropping malformed relay message");
                return true;
            }
        };

        match msg.kind {
            MessageType::Initialization => {
                let id = msg.target;
                self.state().id = Some(id);
                let role = if id.is_master() {
                    BridgeRole::Master
                } else {
                    BridgeRole::Remote
                };
                self.emit(BridgeEvent::Ready { role, id });
            }
            MessageType::Remote => match msg.peer_param() {
                Some(peer) => self.emit(BridgeEvent::Remote(peer)),
                None => warn!("REMOTE without a peer id"),
            },
            MessageType::Failed => self.emit(BridgeEvent::MessageFail {
                target: msg.peer_param().unwrap_or(msg.target),
                message_id: msg.message_id,
            }),
            MessageType::Remove => {
                if let Some(peer) = msg.peer_param() {
                    self.emit(BridgeEvent::Terminated { peer });
                }
            }
            MessageType::Kill => {
                debug!(address = %self.address(), "killed by relay");
                self.state().disposed = true;
                self.emit(BridgeEvent::Terminated {
                    peer: PeerId::MASTER,
                });
                return false;
            }
            _ => self.emit(BridgeEvent::Message(msg)),
        }
        true
    }
}
