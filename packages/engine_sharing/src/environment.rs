//! Capabilities the surrounding environment lends to the sharing core:
//! resolving another context by name, and creating relay processes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::bridge::{PeerRef, RelayHub};

pub trait Environment: Send + Sync + fmt::Debug {
    /// Reference to the context published under `name`, if it is still alive.
    fn resolve(&self, name: &str) -> Option<PeerRef>;

    /// Publish `peer` under `name`. Fails if a live context already holds it.
    fn publish(&self, name: &str, peer: PeerRef) -> bool;

    fn withdraw(&self, name: &str);

    fn name_in_use(&self, name: &str) -> bool;

    /// Whether this context can hold references to other contexts at all.
    fn can_hold_references(&self) -> bool;

    /// Whether a relay process can be created here.
    fn relay_supported(&self) -> bool;

    /// Open (or reuse) the relay at `address`.
    fn open_relay(&self, address: &str) -> Option<RelayHub>;

    fn find_relay(&self, address: &str) -> Option<RelayHub>;

    fn close_relay(&self, address: &str);
}

/// In-process environment: a name table and a relay table shared by every
/// context that holds the same `Arc`.
#[derive(Debug)]
pub struct LocalEnvironment {
    names: Mutex<HashMap<String, PeerRef>>,
    relays: Mutex<HashMap<String, RelayHub>>,
    holds_references: bool,
    relay_capable: bool,
}

impl LocalEnvironment {
    pub fn new() -> Self {
        Self {
            names: Mutex::new(HashMap::new()),
            relays: Mutex::new(HashMap::new()),
            holds_references: true,
            relay_capable: true,
        }
    }

    /// Contexts here cannot reach each other at all.
    pub fn isolated() -> Self {
        Self {
            holds_references: false,
            relay_capable: false,
            ..Self::new()
        }
    }

    pub fn without_relay() -> Self {
        Self {
            relay_capable: false,
            ..Self::new()
        }
    }

    fn names(&self) -> MutexGuard<'_, HashMap<String, PeerRef>> {
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn relays(&self) -> MutexGuard<'_, HashMap<String, RelayHub>> {
        self.relays.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LocalEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for LocalEnvironment {
    fn resolve(&self, name: &str) -> Option<PeerRef> {
        let mut names = self.names();
        match names.get(name) {
            Some(peer) if peer.is_alive() => Some(peer.clone()),
            Some(_) => {
                debug!(name, "dropping dead context reference");
                names.remove(name);
                None
            }
            None => None,
        }
    }

    fn publish(&self, name: &str, peer: PeerRef) -> bool {
        let mut names = self.names();
        if names.get(name).is_some_and(PeerRef::is_alive) {
            return false;
        }
        names.insert(name.to_string(), peer);
        true
    }

    fn withdraw(&self, name: &str) {
        self.names().remove(name);
    }

    fn name_in_use(&self, name: &str) -> bool {
        self.names().get(name).is_some_and(PeerRef::is_alive)
            || self.relays().get(name).is_some_and(|hub| !hub.is_closed())
    }

    fn can_hold_references(&self) -> bool {
        self.holds_references
    }

    fn relay_supported(&self) -> bool {
        self.relay_capable
    }

    fn open_relay(&self, address: &str) -> Option<RelayHub> {
        if !self.relay_capable {
            return None;
        }
        let mut relays = self.relays();
        if let Some(hub) = relays.get(address).filter(|hub| !hub.is_closed()) {
            return Some(hub.clone());
        }
        let hub = RelayHub::spawn(address);
        relays.insert(address.to_string(), hub.clone());
        Some(hub)
    }

    fn find_relay(&self, address: &str) -> Option<RelayHub> {
        let mut relays = self.relays();
        match relays.get(address) {
            Some(hub) if !hub.is_closed() => Some(hub.clone()),
            Some(_) => {
                relays.remove(address);
                None
            }
            None => None,
        }
    }

    fn close_relay(&self, address: &str) {
        if let Some(hub) = self.relays().remove(address) {
            hub.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn dead_references_do_not_resolve() {
        let env = LocalEnvironment::new();
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(env.publish("esh-1", PeerRef::new(tx)));
        assert!(env.name_in_use("esh-1"));
        assert!(env.resolve("esh-1").is_some());

        drop(rx);
        assert!(!env.name_in_use("esh-1"));
        assert!(env.resolve("esh-1").is_none());
    }

    #[test]
    fn publish_refuses_live_names() {
        let env = LocalEnvironment::new();
        let (a, _a_rx) = mpsc::unbounded_channel();
        let (b, _b_rx) = mpsc::unbounded_channel();
        assert!(env.publish("esh-1", PeerRef::new(a)));
        assert!(!env.publish("esh-1", PeerRef::new(b)));
        env.withdraw("esh-1");
        assert!(!env.name_in_use("esh-1"));
    }

    #[tokio::test]
    async fn relay_lifecycle() {
        let env = LocalEnvironment::new();
        let hub = env.open_relay("esh-relay-3").unwrap();
        assert_eq!(env.find_relay("esh-relay-3").unwrap().address(), hub.address());
        assert!(env.name_in_use("esh-relay-3"));

        env.close_relay("esh-relay-3");
        hub.closed().await;
        assert!(env.find_relay("esh-relay-3").is_none());
    }

    #[test]
    fn isolated_environment_has_no_capabilities() {
        let env = LocalEnvironment::isolated();
        assert!(!env.can_hold_references());
        assert!(!env.relay_supported());
        assert!(env.open_relay("esh-relay-1").is_none());
    }
}
