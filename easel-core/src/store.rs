//! Editor record store.
//!
//! [`EditorStore`] is the seam the collaboration layer talks to. It needs
//! three things from an editor: change notifications tagged with their
//! source, an atomic scope for merging remote edits, and the camera
//! transform for presence.
//!
//! [`RecordStore`] is a complete in-memory implementation used by the
//! headless client and throughout the tests.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::diff::RecordsDiff;
use crate::record::{Record, RecordId};
use crate::{Camera, Vec2};

/// Where a change batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// Direct user interaction in this editor.
    User,
    /// Merged from a peer inside [`EditorStore::merge_remote_changes`].
    Remote,
}

/// A change batch plus its provenance, as delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub changes: RecordsDiff,
    pub source: ChangeSource,
}

pub type StoreListener = Box<dyn FnMut(&StoreChange) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),
}

/// Collects the puts and removes of one remote merge.
#[derive(Debug, Default)]
pub struct RemoteTransaction {
    puts: Vec<Record>,
    removes: Vec<RecordId>,
}

impl RemoteTransaction {
    pub fn put(&mut self, records: impl IntoIterator<Item = Record>) {
        self.puts.extend(records);
    }

    pub fn remove(&mut self, ids: impl IntoIterator<Item = RecordId>) {
        self.removes.extend(ids);
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty()
    }

    fn into_parts(self) -> (Vec<Record>, Vec<RecordId>) {
        (self.puts, self.removes)
    }
}

/// What the collaboration layer needs from an editor.
pub trait EditorStore {
    /// Register a change listener. Every committed batch is delivered once.
    fn listen(&mut self, listener: StoreListener) -> ListenerId;

    /// Deregister a listener. Returns `false` if it was already gone.
    fn unlisten(&mut self, id: ListenerId) -> bool;

    /// Apply remote edits atomically: all puts first, then all removes,
    /// announced as a single [`ChangeSource::Remote`] batch.
    fn merge_remote_changes<F>(&mut self, f: F) -> RecordsDiff
    where
        F: FnOnce(&mut RemoteTransaction);

    /// Current state of one record.
    fn record(&self, id: &str) -> Option<Record>;

    /// Every record currently in the store.
    fn snapshot(&self) -> Vec<Record>;

    /// Convert a screen point into page coordinates.
    fn screen_to_page(&self, point: Vec2) -> Vec2;

    /// Current camera zoom.
    fn zoom(&self) -> f64;
}

/// In-memory record store with change listeners.
pub struct RecordStore {
    records: BTreeMap<RecordId, Record>,
    listeners: Vec<(ListenerId, StoreListener)>,
    next_listener: u64,
    camera: Camera,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            listeners: Vec::new(),
            next_listener: 0,
            camera: Camera::default(),
        }
    }

    /// Insert or replace records as a user edit.
    pub fn put(&mut self, records: impl IntoIterator<Item = Record>) -> RecordsDiff {
        let diff = self.apply(records, std::iter::empty());
        self.emit(&diff, ChangeSource::User);
        diff
    }

    /// Modify one record in place as a user edit.
    pub fn update<F>(&mut self, id: &RecordId, f: F) -> Result<RecordsDiff, StoreError>
    where
        F: FnOnce(&mut Record),
    {
        let mut next = self
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::RecordNotFound(id.clone()))?;
        f(&mut next);
        Ok(self.put([next]))
    }

    /// Remove records as a user edit. Unknown ids are ignored.
    pub fn remove(&mut self, ids: impl IntoIterator<Item = RecordId>) -> RecordsDiff {
        let diff = self.apply(std::iter::empty(), ids);
        self.emit(&diff, ChangeSource::User);
        diff
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn camera(&self) -> Camera {
        self.camera
    }

    /// Move the camera. Camera state is local and never reported.
    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn apply(
        &mut self,
        puts: impl IntoIterator<Item = Record>,
        removes: impl IntoIterator<Item = RecordId>,
    ) -> RecordsDiff {
        let mut diff = RecordsDiff::new();

        for record in puts {
            let id = record.id.clone();
            match self.records.insert(id.clone(), record.clone()) {
                None => {
                    diff.added.insert(id, record);
                }
                Some(prev) if prev == record => {}
                Some(prev) => {
                    let mut step = RecordsDiff::new();
                    step.updated.insert(id, (prev, record));
                    diff.squash(step);
                }
            }
        }

        for id in removes {
            if let Some(prev) = self.records.remove(&id) {
                let mut step = RecordsDiff::new();
                step.removed.insert(id, prev);
                diff.squash(step);
            }
        }

        diff
    }

    fn emit(&mut self, diff: &RecordsDiff, source: ChangeSource) {
        if diff.is_empty() {
            return;
        }
        let change = StoreChange {
            changes: diff.clone(),
            source,
        };
        for (_, listener) in self.listeners.iter_mut() {
            listener(&change);
        }
    }
}

impl EditorStore for RecordStore {
    fn listen(&mut self, listener: StoreListener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    fn unlisten(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn merge_remote_changes<F>(&mut self, f: F) -> RecordsDiff
    where
        F: FnOnce(&mut RemoteTransaction),
    {
        let mut txn = RemoteTransaction::default();
        f(&mut txn);
        if txn.is_empty() {
            return RecordsDiff::new();
        }
        let (puts, removes) = txn.into_parts();
        let diff = self.apply(puts, removes);
        log::trace!("merged remote changes: {} records touched", diff.len());
        self.emit(&diff, ChangeSource::Remote);
        diff
    }

    fn record(&self, id: &str) -> Option<Record> {
        self.records.get(id).cloned()
    }

    fn snapshot(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }

    fn screen_to_page(&self, point: Vec2) -> Vec2 {
        self.camera.screen_to_page(point)
    }

    fn zoom(&self) -> f64 {
        self.camera.z
    }
}
