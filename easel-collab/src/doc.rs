//! Shared document: a Yrs map from record id to record JSON.
//!
//! ```text
//!   LocalTransaction ──commit──┐           import(bytes)
//!   (origin "local")           ▼           (origin "import")
//!                        ┌───────────┐          │
//!                        │  Yrs Doc  │◄─────────┘
//!                        │  "records"│
//!                        └─────┬─────┘
//!                              │ MapRef::observe
//!                              ▼
//!                     change queue (MapChange)
//!                              │ take_changes()
//!                              ▼
//!                    session dispatch by origin
//! ```
//!
//! Observer callbacks fire inside the committing transaction, so they only
//! enqueue. The session drains the queue after every commit or import and
//! dispatches outside of any transaction.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use yrs::types::map::MapEvent;
use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Doc, Map, MapRef, Observable, Origin, Out, ReadTxn, StateVector, Subscription,
    Transact, TransactionMut, Update,
};

use crate::error::{CollabError, CollabResult};

pub const DEFAULT_MAP_NAME: &str = "records";

/// Origin tag of transactions opened by [`SharedDoc::transact`].
pub const LOCAL_ORIGIN: &str = "easel:local";

/// Origin tag of transactions opened by [`SharedDoc::import`].
pub const IMPORT_ORIGIN: &str = "easel:import";

/// Who produced a map change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A local commit through [`LocalTransaction`].
    Local,
    /// A remote update merged through [`SharedDoc::import`].
    Import,
    /// Any other transaction on the same document.
    Other,
}

impl ChangeOrigin {
    fn of(origin: Option<&Origin>) -> Self {
        match origin {
            Some(o) if *o == Origin::from(LOCAL_ORIGIN) => ChangeOrigin::Local,
            Some(o) if *o == Origin::from(IMPORT_ORIGIN) => ChangeOrigin::Import,
            _ => ChangeOrigin::Other,
        }
    }
}

/// New value of one key after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    Json(String),
    /// The key was deleted (or explicitly set to null).
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDiff {
    pub key: String,
    pub value: EntryValue,
}

/// One map change notification: every key touched by one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapChange {
    pub by: ChangeOrigin,
    pub entries: Vec<EntryDiff>,
}

/// Opaque document version. Only used as an export lower bound and for
/// equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Version(StateVector);

impl Version {
    /// The version of an empty document.
    pub fn initial() -> Self {
        Self::default()
    }
}

/// Write scope over the shared map. Changes become visible to observers
/// on [`commit`](LocalTransaction::commit).
pub struct LocalTransaction<'doc> {
    txn: TransactionMut<'doc>,
    map: MapRef,
    writes: usize,
}

impl LocalTransaction<'_> {
    /// Write a record's JSON under its key.
    pub fn put(&mut self, key: &str, json: String) {
        self.map.insert(&mut self.txn, key, json);
        self.writes += 1;
    }

    /// Delete a key by overwriting it with a null tombstone. Returns
    /// `false` if it was absent or already deleted.
    ///
    /// A plain map removal only extends the delete set and leaves the state
    /// vector where it was, so version-gated publishing would never see it.
    /// The tombstone is a real write and carries the clock forward.
    pub fn delete(&mut self, key: &str) -> bool {
        let live = self
            .map
            .get(&self.txn, key)
            .is_some_and(|value| is_live(&value));
        if live {
            self.map.insert(&mut self.txn, key, Any::Null);
            self.writes += 1;
        }
        live
    }

    /// Commit and return the number of writes.
    pub fn commit(mut self) -> usize {
        self.txn.commit();
        self.writes
    }
}

pub struct SharedDoc {
    doc: Doc,
    map: MapRef,
    changes: Arc<Mutex<VecDeque<MapChange>>>,
    _subscription: Subscription,
}

impl SharedDoc {
    pub fn new(map_name: &str) -> Self {
        Self::from_doc(Doc::new(), map_name)
    }

    /// Create with a fixed peer id (client id).
    pub fn with_peer_id(peer_id: u64, map_name: &str) -> Self {
        Self::from_doc(Doc::with_client_id(peer_id), map_name)
    }

    fn from_doc(doc: Doc, map_name: &str) -> Self {
        let map = doc.get_or_insert_map(map_name);
        let changes = Arc::new(Mutex::new(VecDeque::new()));

        let queue = changes.clone();
        let subscription = map.observe(move |txn, event: &MapEvent| {
            let change = MapChange {
                by: ChangeOrigin::of(txn.origin()),
                entries: collect_entries(txn, event),
            };
            match queue.lock() {
                Ok(mut q) => q.push_back(change),
                Err(_) => log::error!("map change queue poisoned; change dropped"),
            }
        });

        Self {
            doc,
            map,
            changes,
            _subscription: subscription,
        }
    }

    /// Stable peer id of this replica.
    pub fn peer_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Open a local write scope.
    pub fn transact(&self) -> LocalTransaction<'_> {
        LocalTransaction {
            txn: self.doc.transact_mut_with(LOCAL_ORIGIN),
            map: self.map.clone(),
            writes: 0,
        }
    }

    /// JSON stored under `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        match self.map.get(&txn, key)? {
            Out::Any(Any::String(s)) => Some(s.to_string()),
            Out::Any(Any::Null) | Out::Any(Any::Undefined) => None,
            other => Some(other.to_string(&txn)),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of live keys. Tombstones are not counted.
    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.map.iter(&txn).filter(|(_, value)| is_live(value)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the whole map, ordered by key.
    pub fn entries(&self) -> BTreeMap<String, String> {
        let txn = self.doc.transact();
        self.map
            .iter(&txn)
            .filter_map(|(key, value)| match value {
                Out::Any(Any::String(s)) => Some((key.to_string(), s.to_string())),
                Out::Any(Any::Null) | Out::Any(Any::Undefined) => None,
                other => Some((key.to_string(), other.to_string(&txn))),
            })
            .collect()
    }

    /// Current version.
    pub fn version(&self) -> Version {
        Version(self.doc.transact().state_vector())
    }

    /// Every operation not covered by `from`.
    pub fn export_from(&self, from: &Version) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(&from.0)
    }

    /// Full document state as a single update.
    pub fn export_all(&self) -> Vec<u8> {
        self.export_from(&Version::initial())
    }

    /// Merge a remote update through the CRDT's own integration path.
    pub fn import(&self, update: &[u8]) -> CollabResult<()> {
        let update =
            Update::decode_v1(update).map_err(|e| CollabError::UpdateDecode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(IMPORT_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| CollabError::UpdateApply(e.to_string()))?;
        txn.commit();
        Ok(())
    }

    /// Drain queued change notifications in commit order.
    pub fn take_changes(&self) -> Vec<MapChange> {
        match self.changes.lock() {
            Ok(mut q) => q.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn collect_entries(txn: &TransactionMut, event: &MapEvent) -> Vec<EntryDiff> {
    let mut entries: Vec<EntryDiff> = event
        .keys(txn)
        .iter()
        .map(|(key, change)| {
            let value = match change {
                EntryChange::Inserted(new) | EntryChange::Updated(_, new) => entry_value(new, txn),
                EntryChange::Removed(_) => EntryValue::Deleted,
            };
            EntryDiff {
                key: key.to_string(),
                value,
            }
        })
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
}

fn entry_value(out: &Out, txn: &TransactionMut) -> EntryValue {
    match out {
        Out::Any(Any::String(s)) => EntryValue::Json(s.to_string()),
        Out::Any(Any::Null) | Out::Any(Any::Undefined) => EntryValue::Deleted,
        other => EntryValue::Json(other.clone().to_string(txn)),
    }
}

fn is_live(value: &Out) -> bool {
    !matches!(value, Out::Any(Any::Null) | Out::Any(Any::Undefined))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(peer: u64) -> SharedDoc {
        SharedDoc::with_peer_id(peer, DEFAULT_MAP_NAME)
    }

    #[test]
    fn test_local_commit_notifies_with_local_origin() {
        let a = doc(1);
        let mut txn = a.transact();
        txn.put("shape:s1", r#"{"id":"shape:s1"}"#.to_string());
        assert_eq!(txn.commit(), 1);

        let changes = a.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].by, ChangeOrigin::Local);
        assert_eq!(
            changes[0].entries,
            vec![EntryDiff {
                key: "shape:s1".into(),
                value: EntryValue::Json(r#"{"id":"shape:s1"}"#.into()),
            }]
        );
        assert!(a.take_changes().is_empty());
    }

    #[test]
    fn test_empty_commit_is_silent() {
        let a = doc(1);
        assert_eq!(a.transact().commit(), 0);
        assert!(a.take_changes().is_empty());
    }

    #[test]
    fn test_import_notifies_with_import_origin() {
        let a = doc(1);
        let b = doc(2);

        let mut txn = a.transact();
        txn.put("shape:s1", "{}".to_string());
        txn.commit();

        b.import(&a.export_all()).unwrap();
        let changes = b.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].by, ChangeOrigin::Import);
        assert_eq!(b.get("shape:s1").as_deref(), Some("{}"));
    }

    #[test]
    fn test_delete_shows_as_deleted_entry() {
        let a = doc(1);
        let b = doc(2);

        let mut txn = a.transact();
        txn.put("shape:s1", "{}".to_string());
        txn.commit();
        b.import(&a.export_all()).unwrap();
        let after_add = a.version();
        b.take_changes();

        let mut txn = a.transact();
        assert!(txn.delete("shape:s1"));
        txn.commit();

        b.import(&a.export_from(&after_add)).unwrap();
        let changes = b.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entries[0].value, EntryValue::Deleted);
        assert!(!b.contains_key("shape:s1"));
    }

    #[test]
    fn test_delete_missing_key() {
        let a = doc(1);
        let mut txn = a.transact();
        assert!(!txn.delete("shape:none"));
        assert_eq!(txn.commit(), 0);
    }

    #[test]
    fn test_delete_advances_version() {
        let a = doc(1);
        let mut txn = a.transact();
        txn.put("shape:s1", "{}".to_string());
        txn.commit();
        let after_add = a.version();
        a.take_changes();

        let mut txn = a.transact();
        assert!(txn.delete("shape:s1"));
        assert_eq!(txn.commit(), 1);

        assert_ne!(a.version(), after_add);
        assert!(a.is_empty());
        assert_eq!(a.len(), 0);
        assert!(a.entries().is_empty());

        let changes = a.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].by, ChangeOrigin::Local);
        assert_eq!(changes[0].entries[0].value, EntryValue::Deleted);

        // Deleting again is a no-op.
        let mut txn = a.transact();
        assert!(!txn.delete("shape:s1"));
        assert_eq!(txn.commit(), 0);
        assert!(a.take_changes().is_empty());
    }

    #[test]
    fn test_put_after_delete_revives_key() {
        let a = doc(1);
        let b = doc(2);
        let mut txn = a.transact();
        txn.put("shape:s1", "1".to_string());
        txn.commit();
        let mut txn = a.transact();
        txn.delete("shape:s1");
        txn.commit();
        let mut txn = a.transact();
        txn.put("shape:s1", "2".to_string());
        txn.commit();

        b.import(&a.export_all()).unwrap();
        assert_eq!(b.get("shape:s1").as_deref(), Some("2"));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_export_from_current_version_is_empty_update() {
        let a = doc(1);
        let mut txn = a.transact();
        txn.put("shape:s1", "{}".to_string());
        txn.commit();
        a.take_changes();

        let empty = a.export_from(&a.version());
        let b = doc(2);
        b.import(&empty).unwrap();
        assert!(b.is_empty());
        assert!(b.take_changes().is_empty());
    }

    #[test]
    fn test_incremental_export_covers_gap() {
        let a = doc(1);
        let b = doc(2);

        let mut txn = a.transact();
        txn.put("shape:1", "1".to_string());
        txn.commit();
        b.import(&a.export_all()).unwrap();
        let v1 = a.version();

        let mut txn = a.transact();
        txn.put("shape:2", "2".to_string());
        txn.commit();
        let mut txn = a.transact();
        txn.put("shape:3", "3".to_string());
        txn.commit();

        b.import(&a.export_from(&v1)).unwrap();
        assert_eq!(a.entries(), b.entries());
        assert_eq!(a.version(), b.version());
    }

    #[test]
    fn test_import_garbage_fails() {
        let a = doc(1);
        assert!(matches!(
            a.import(&[0xFF, 0xFF, 0xFF]),
            Err(CollabError::UpdateDecode(_))
        ));
        assert!(a.import(&[]).is_err());
        assert!(a.take_changes().is_empty());
    }

    #[test]
    fn test_version_advances() {
        let a = doc(1);
        let v0 = a.version();
        assert_eq!(v0, Version::initial());

        let mut txn = a.transact();
        txn.put("shape:1", "1".to_string());
        txn.commit();
        assert_ne!(a.version(), v0);
    }

    #[test]
    fn test_peer_id() {
        assert_eq!(doc(42).peer_id(), 42);
    }
}
