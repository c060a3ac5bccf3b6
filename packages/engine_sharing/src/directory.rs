//! Per-context service object: instance id allocation, channel ids, and
//! the local directory of sharable engines.
//!
//! One `Directory` stands for one execution context. Everything that would
//! otherwise be a global registry lives here and is passed in explicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use tracing::debug;

use crate::engine::SessionEngine;
use crate::environment::Environment;
use crate::types::{InstanceId, Namespace};

pub struct Directory {
    next_id: AtomicU64,
    next_channel: AtomicU64,
    presence: Mutex<HashMap<Namespace, InstanceId>>,
    engines: Mutex<HashMap<InstanceId, Arc<dyn SessionEngine>>>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("next_id", &self.next_id)
            .field("presence", &*self.presence())
            .field("engines", &self.engines().len())
            .finish()
    }
}

impl Directory {
    /// Ids start at a random point so contexts sharing a store rarely
    /// draw the same ones.
    pub fn new() -> Self {
        Self::starting_at(rand::rng().random_range(1..=u32::MAX as u64))
    }

    pub fn starting_at(first_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first_id.max(1)),
            next_channel: AtomicU64::new(1),
            presence: Mutex::new(HashMap::new()),
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Draw the next id whose bridge and relay names are free in `env`.
    pub fn allocate_id(&self, env: &dyn Environment) -> InstanceId {
        loop {
            let id = InstanceId(self.next_id.fetch_add(1, Ordering::SeqCst));
            if env.name_in_use(&id.peer_name()) || env.name_in_use(&id.relay_address()) {
                debug!(%id, "instance id taken, drawing again");
                continue;
            }
            return id;
        }
    }

    pub fn next_channel_id(&self) -> u64 {
        self.next_channel.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register_presence(&self, namespace: &Namespace, id: InstanceId) {
        self.presence().insert(namespace.clone(), id);
    }

    /// Only removes the entry if it still belongs to `id`.
    pub fn unregister_presence(&self, namespace: &Namespace, id: InstanceId) {
        let mut presence = self.presence();
        if presence.get(namespace) == Some(&id) {
            presence.remove(namespace);
        }
    }

    pub fn register_engine(&self, id: InstanceId, engine: Arc<dyn SessionEngine>) {
        self.engines().insert(id, engine);
    }

    pub fn remove_engine(&self, id: InstanceId) {
        self.engines().remove(&id);
    }

    pub fn engine(&self, id: InstanceId) -> Option<Arc<dyn SessionEngine>> {
        self.engines().get(&id).cloned()
    }

    /// The engine registered for `namespace` in this context.
    pub fn lookup(&self, namespace: &Namespace) -> Option<(InstanceId, Arc<dyn SessionEngine>)> {
        let id = *self.presence().get(namespace)?;
        self.engine(id).map(|engine| (id, engine))
    }

    fn presence(&self) -> MutexGuard<'_, HashMap<Namespace, InstanceId>> {
        self.presence.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn engines(&self) -> MutexGuard<'_, HashMap<InstanceId, Arc<dyn SessionEngine>>> {
        self.engines.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::PeerRef;
    use crate::engine::RecordingEngine;
    use crate::environment::LocalEnvironment;
    use tokio::sync::mpsc;

    #[test]
    fn ids_are_monotonic_and_skip_taken_names() {
        let env = LocalEnvironment::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        env.publish("esh-11", PeerRef::new(tx));

        let dir = Directory::starting_at(10);
        assert_eq!(dir.allocate_id(&env), InstanceId(10));
        assert_eq!(dir.allocate_id(&env), InstanceId(12));
        assert_eq!(dir.allocate_id(&env), InstanceId(13));
    }

    #[test]
    fn channel_ids_increase() {
        let dir = Directory::starting_at(1);
        let a = dir.next_channel_id();
        assert_eq!(dir.next_channel_id(), a + 1);
    }

    #[test]
    fn lookup_needs_presence_and_engine() {
        let dir = Directory::starting_at(1);
        let ns = Namespace::new("app1").unwrap();
        assert!(dir.lookup(&ns).is_none());

        dir.register_presence(&ns, InstanceId(5));
        assert!(dir.lookup(&ns).is_none());

        dir.register_engine(InstanceId(5), Arc::new(RecordingEngine::new()));
        assert_eq!(dir.lookup(&ns).map(|(id, _)| id), Some(InstanceId(5)));

        dir.unregister_presence(&ns, InstanceId(6));
        assert!(dir.lookup(&ns).is_some());
        dir.unregister_presence(&ns, InstanceId(5));
        assert!(dir.lookup(&ns).is_none());
    }
}
