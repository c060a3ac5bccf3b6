//! Composed-value codec on top of a [`SharedStore`].
//!
//! Key format (every key carries [`KEY_PREFIX`]):
//! - presence record: `<prefix><instanceId>_<namespace>` →
//!   `timestamp|directAddress|originHost|buildId|pageProtocol|workerAddress`
//!   with `NONE` standing in for a missing address
//! - id list: `<prefix><namespace-or-resource-key>` → `|id1|id2|...|`
//!
//! Reads never fail: store errors and malformed values are logged and
//! reported as absent.

use std::sync::Arc;

use tracing::{debug, warn};

use super::SharedStore;
use crate::types::{InstanceId, Namespace};

pub const KEY_PREFIX: &str = "esh.";
pub const NONE: &str = "NONE";
const SEP: char = '|';

/// What a presence record must agree on to be usable by this instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    pub host: String,
    pub build_id: String,
    pub page_protocol: String,
}

impl Origin {
    pub fn new(host: &str, build_id: &str, page_protocol: &str) -> Self {
        Self {
            host: host.to_string(),
            build_id: build_id.to_string(),
            page_protocol: page_protocol.to_string(),
        }
    }
}

/// Storage-resident proof that an instance is alive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceRecord {
    pub timestamp: i64,
    pub direct_address: Option<String>,
    pub origin_host: String,
    pub build_id: String,
    pub page_protocol: String,
    pub worker_address: Option<String>,
}

impl PresenceRecord {
    pub fn new(
        timestamp: i64,
        origin: &Origin,
        direct_address: Option<String>,
        worker_address: Option<String>,
    ) -> Self {
        Self {
            timestamp,
            direct_address,
            origin_host: origin.host.clone(),
            build_id: origin.build_id.clone(),
            page_protocol: origin.page_protocol.clone(),
            worker_address,
        }
    }

    pub fn encode(&self) -> String {
        [
            self.timestamp.to_string(),
            self.direct_address.clone().unwrap_or_else(|| NONE.into()),
            self.origin_host.clone(),
            self.build_id.clone(),
            self.page_protocol.clone(),
            self.worker_address.clone().unwrap_or_else(|| NONE.into()),
        ]
        .join("|")
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let fields: Vec<&str> = raw.split(SEP).collect();
        let [ts, direct, host, build, protocol, worker] = fields.as_slice() else {
            return None;
        };
        let address = |s: &str| (s != NONE && !s.is_empty()).then(|| s.to_string());
        Some(Self {
            timestamp: ts.parse().ok()?,
            direct_address: address(direct),
            origin_host: host.to_string(),
            build_id: build.to_string(),
            page_protocol: protocol.to_string(),
            worker_address: address(worker),
        })
    }

    /// Build and page protocol must match; the origin host is informative.
    pub fn is_compatible(&self, origin: &Origin) -> bool {
        self.build_id == origin.build_id && self.page_protocol == origin.page_protocol
    }

    pub fn age_millis(&self, now_millis: i64) -> i64 {
        now_millis - self.timestamp
    }

    pub fn is_stale(&self, now_millis: i64, stale_after_millis: i64) -> bool {
        self.age_millis(now_millis) > stale_after_millis
    }

    /// Reachable through a relay rather than a direct context reference.
    pub fn is_fast_link(&self) -> bool {
        self.worker_address.is_some()
    }
}

/// Result of looking a presence record up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordState {
    Absent,
    Malformed,
    Present(PresenceRecord),
}

/// Classification of a key written by this subsystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyKind<'a> {
    Presence {
        id: InstanceId,
        namespace: &'a str,
    },
    IdList {
        name: &'a str,
    },
}

pub fn presence_key(id: InstanceId, namespace: &Namespace) -> String {
    format!("{}{}_{}", KEY_PREFIX, id, namespace)
}

pub fn list_key(name: &str) -> String {
    format!("{}{}", KEY_PREFIX, name)
}

/// Id-list names must not be confusable with presence keys.
pub fn valid_list_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('_') && !name.contains(SEP)
}

pub fn classify_key(key: &str) -> Option<KeyKind<'_>> {
    let rest = key.strip_prefix(KEY_PREFIX)?;
    match rest.split_once('_') {
        Some((id, namespace)) => Some(KeyKind::Presence {
            id: id.parse().ok()?,
            namespace,
        }),
        None if !rest.is_empty() => Some(KeyKind::IdList { name: rest }),
        None => None,
    }
}

fn encode_ids(ids: &[String]) -> String {
    let mut out = String::from("|");
    for id in ids {
        out.push_str(id);
        out.push(SEP);
    }
    out
}

fn decode_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.split(SEP).filter(|s| !s.is_empty()) {
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Presence records and id lists over a shared store.
#[derive(Clone, Debug)]
pub struct StatusStore {
    store: Arc<dyn SharedStore>,
}

impl StatusStore {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    fn read_raw(&self, key: &str) -> Option<String> {
        match self.store.read(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "store read failed, treating as absent");
                None
            }
        }
    }

    fn write_raw(&self, key: &str, value: &str) -> bool {
        match self.store.write(key, value) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "store write failed");
                false
            }
        }
    }

    /// Returns false, after logging, if the store refused.
    pub(crate) fn clean_raw(&self, key: &str) -> bool {
        match self.store.clean(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "store clean failed");
                false
            }
        }
    }

    /// Add `id` to the list. Idempotent; returns true if the list changed.
    pub fn add_id(&self, list: &str, id: InstanceId) -> bool {
        let key = list_key(list);
        let id = id.to_string();
        let mut ids = self.read_raw(&key).map(|raw| decode_ids(&raw)).unwrap_or_default();
        if ids.contains(&id) {
            return false;
        }
        ids.push(id);
        self.write_raw(&key, &encode_ids(&ids))
    }

    /// Remove `id` from the list. A no-op for non-members.
    pub fn remove_id(&self, list: &str, id: InstanceId) -> bool {
        let key = list_key(list);
        let id = id.to_string();
        let Some(raw) = self.read_raw(&key) else {
            return false;
        };
        let mut ids = decode_ids(&raw);
        let before = ids.len();
        ids.retain(|existing| *existing != id);
        if ids.len() == before {
            return false;
        }
        self.write_ids_raw(&key, &ids);
        true
    }

    /// Ordered members of the list. Entries that are not ids are skipped.
    pub fn read_ids(&self, list: &str) -> Vec<InstanceId> {
        self.read_raw(&list_key(list))
            .map(|raw| {
                decode_ids(&raw)
                    .iter()
                    .filter_map(|id| match id.parse() {
                        Ok(id) => Some(id),
                        Err(_) => {
                            debug!(list, id = %id, "ignoring malformed id list entry");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace the list wholesale; an empty list removes the key.
    pub fn write_ids(&self, list: &str, ids: &[InstanceId]) {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.write_ids_raw(&list_key(list), &ids);
    }

    fn write_ids_raw(&self, key: &str, ids: &[String]) {
        if ids.is_empty() {
            self.clean_raw(key);
        } else {
            self.write_raw(key, &encode_ids(ids));
        }
    }

    pub fn inspect(&self, id: InstanceId, namespace: &Namespace) -> RecordState {
        self.inspect_key(&presence_key(id, namespace))
    }

    pub fn inspect_key(&self, key: &str) -> RecordState {
        match self.read_raw(key) {
            None => RecordState::Absent,
            Some(raw) => match PresenceRecord::decode(&raw) {
                Some(record) => RecordState::Present(record),
                None => RecordState::Malformed,
            },
        }
    }

    pub fn read_shared_status(&self, id: InstanceId, namespace: &Namespace) -> Option<PresenceRecord> {
        match self.inspect(id, namespace) {
            RecordState::Present(record) => Some(record),
            RecordState::Absent | RecordState::Malformed => None,
        }
    }

    pub fn write_shared_status(
        &self,
        id: InstanceId,
        namespace: &Namespace,
        record: &PresenceRecord,
    ) -> bool {
        self.write_raw(&presence_key(id, namespace), &record.encode())
    }

    pub fn clean_shared_status(&self, id: InstanceId, namespace: &Namespace) {
        self.clean_raw(&presence_key(id, namespace));
    }

    /// Full presence records of the namespace's members. Ids without a
    /// readable record are silently dropped.
    pub fn read_ids_objects(&self, namespace: &Namespace) -> Vec<(InstanceId, PresenceRecord)> {
        self.read_ids(namespace.as_str())
            .into_iter()
            .filter_map(|id| self.read_shared_status(id, namespace).map(|r| (id, r)))
            .collect()
    }

    /// Members of `list` that currently own a non-stale record in any
    /// namespace.
    pub fn live_ids(&self, list: &str, now_millis: i64, stale_after_millis: i64) -> Vec<InstanceId> {
        let keys = self.get_all_keys();
        self.read_ids(list)
            .into_iter()
            .filter(|id| {
                keys.iter().any(|key| match classify_key(key) {
                    Some(KeyKind::Presence { id: owner, .. }) if owner == *id => {
                        matches!(self.inspect_key(key), RecordState::Present(r) if !r.is_stale(now_millis, stale_after_millis))
                    }
                    _ => false,
                })
            })
            .collect()
    }

    /// Every key of this subsystem, leaving unrelated data alone.
    pub fn get_all_keys(&self) -> Vec<String> {
        match self.store.keys() {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| k.starts_with(KEY_PREFIX))
                .collect(),
            Err(e) => {
                warn!(error = %e, "store key enumeration failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn origin() -> Origin {
        Origin::new("example.com", "b1", "https")
    }

    fn ns() -> Namespace {
        Namespace::new("app1").unwrap()
    }

    #[test]
    fn record_encoding_matches_wire_layout() {
        let record = PresenceRecord::new(1_700_000_000_000, &origin(), Some("esh-3".into()), None);
        assert_eq!(record.encode(), "1700000000000|esh-3|example.com|b1|https|NONE");
        assert_eq!(PresenceRecord::decode(&record.encode()), Some(record));
    }

    #[test]
    fn malformed_records_decode_to_none() {
        assert!(PresenceRecord::decode("").is_none());
        assert!(PresenceRecord::decode("abc|NONE|h|b|p|NONE").is_none());
        assert!(PresenceRecord::decode("1|NONE|h|b|p").is_none());
        assert!(PresenceRecord::decode("1|NONE|h|b|p|NONE|extra").is_none());
    }

    #[test]
    fn compatibility_ignores_host() {
        let record = PresenceRecord::new(1, &Origin::new("other.com", "b1", "https"), None, None);
        assert!(record.is_compatible(&origin()));
        assert!(!record.is_compatible(&Origin::new("example.com", "b2", "https")));
        assert!(!record.is_compatible(&Origin::new("example.com", "b1", "http")));
    }

    #[test]
    fn fast_link_means_relay_address() {
        let relay = PresenceRecord::new(1, &origin(), None, Some("esh-relay-1".into()));
        let direct = PresenceRecord::new(1, &origin(), Some("esh-1".into()), None);
        assert!(relay.is_fast_link());
        assert!(!direct.is_fast_link());
    }

    #[test]
    fn key_classification() {
        assert_eq!(presence_key(InstanceId(7), &ns()), "esh.7_app1");
        assert_eq!(
            classify_key("esh.7_app1"),
            Some(KeyKind::Presence {
                id: InstanceId(7),
                namespace: "app1"
            })
        );
        assert_eq!(classify_key("esh.app1"), Some(KeyKind::IdList { name: "app1" }));
        assert_eq!(classify_key("esh.x_app1"), None);
        assert_eq!(classify_key("unrelated"), None);
        assert_eq!(classify_key("esh."), None);
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let status = StatusStore::new(Arc::new(MemoryStore::new()));
        assert!(status.add_id("app1", InstanceId(1)));
        assert!(!status.add_id("app1", InstanceId(1)));
        assert!(status.add_id("app1", InstanceId(2)));
        assert_eq!(status.read_ids("app1"), vec![InstanceId(1), InstanceId(2)]);
        assert_eq!(
            status.store().read("esh.app1").unwrap().as_deref(),
            Some("|1|2|")
        );

        assert!(!status.remove_id("app1", InstanceId(9)));
        assert!(status.remove_id("app1", InstanceId(1)));
        assert_eq!(status.read_ids("app1"), vec![InstanceId(2)]);
        assert!(status.remove_id("app1", InstanceId(2)));
        assert!(status.store().read("esh.app1").unwrap().is_none());
    }

    #[test]
    fn read_ids_tolerates_garbage() {
        let store = MemoryStore::new();
        store.write("esh.app1", "|1||x|1|3").unwrap();
        let status = StatusStore::new(Arc::new(store));
        assert_eq!(status.read_ids("app1"), vec![InstanceId(1), InstanceId(3)]);
    }

    #[test]
    fn read_ids_objects_drops_missing_records() {
        let status = StatusStore::new(Arc::new(MemoryStore::new()));
        status.add_id("app1", InstanceId(1));
        status.add_id("app1", InstanceId(2));
        let record = PresenceRecord::new(10, &origin(), None, None);
        status.write_shared_status(InstanceId(2), &ns(), &record);

        let objects = status.read_ids_objects(&ns());
        assert_eq!(objects, vec![(InstanceId(2), record)]);
    }

    #[test]
    fn live_ids_filters_stale_members() {
        let status = StatusStore::new(Arc::new(MemoryStore::new()));
        let ns = ns();
        for id in [1, 2, 3] {
            status.add_id("connections-to-srv", InstanceId(id));
        }
        status.write_shared_status(InstanceId(1), &ns, &PresenceRecord::new(10_000, &origin(), None, None));
        status.write_shared_status(InstanceId(2), &ns, &PresenceRecord::new(1_000, &origin(), None, None));

        let live = status.live_ids("connections-to-srv", 10_500, 3_000);
        assert_eq!(live, vec![InstanceId(1)]);
    }

    #[test]
    fn get_all_keys_skips_foreign_data() {
        let store = MemoryStore::new();
        store.write("someone.else", "x").unwrap();
        store.write("esh.app1", "|1|").unwrap();
        let status = StatusStore::new(Arc::new(store));
        assert_eq!(status.get_all_keys(), vec!["esh.app1".to_string()]);
    }

    #[test]
    fn list_names() {
        assert!(valid_list_name("connections-to-srv"));
        assert!(!valid_list_name("a_b"));
        assert!(!valid_list_name(""));
    }
}
