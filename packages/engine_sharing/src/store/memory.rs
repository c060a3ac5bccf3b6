use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::SharedStore;
use crate::error::StoreError;

/// In-process store. Clones share the same entries, so every context in
/// the process sees the same data.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    reads: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `read` calls served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SharedStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clean(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries().keys().cloned().collect())
    }
}

/// Store for single-context use: remembers nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStore;

impl SharedStore for NullStore {
    fn read(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn write(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn clean(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_entries() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.write("k", "v").unwrap();
        assert_eq!(b.read("k").unwrap().as_deref(), Some("v"));
        b.clean("k").unwrap();
        assert!(a.read("k").unwrap().is_none());
        assert_eq!(a.read_count(), 2);
    }

    #[test]
    fn null_store_forgets() {
        let s = NullStore;
        s.write("k", "v").unwrap();
        assert!(s.read("k").unwrap().is_none());
        assert!(s.keys().unwrap().is_empty());
    }
}
