//! Change batches emitted by the editor store.

use std::collections::BTreeMap;

use crate::record::{Record, RecordId};

/// One coalesced mutation of the store.
///
/// `updated` holds `(from, to)` pairs. A batch is immutable once emitted;
/// consumers that need to accumulate batches use [`RecordsDiff::squash`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordsDiff {
    pub added: BTreeMap<RecordId, Record>,
    pub updated: BTreeMap<RecordId, (Record, Record)>,
    pub removed: BTreeMap<RecordId, Record>,
}

impl RecordsDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Total number of touched records.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// Every key touched by this batch.
    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.added
            .keys()
            .chain(self.updated.keys())
            .chain(self.removed.keys())
    }

    /// Every record carried by this batch (the `to` side for updates).
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.added
            .values()
            .chain(self.updated.values().map(|(_, to)| to))
            .chain(self.removed.values())
    }

    /// Split off the added part.
    pub fn only_added(&self) -> RecordsDiff {
        RecordsDiff {
            added: self.added.clone(),
            ..RecordsDiff::default()
        }
    }

    /// Split off the updated part.
    pub fn only_updated(&self) -> RecordsDiff {
        RecordsDiff {
            updated: self.updated.clone(),
            ..RecordsDiff::default()
        }
    }

    /// Split off the removed part.
    pub fn only_removed(&self) -> RecordsDiff {
        RecordsDiff {
            removed: self.removed.clone(),
            ..RecordsDiff::default()
        }
    }

    /// Fold a later batch into this one, keeping the net effect.
    ///
    /// An update after an add stays an add (with the new value); an update
    /// after an update keeps the original `from`; a removal cancels a
    /// pending add entirely.
    pub fn squash(&mut self, later: RecordsDiff) {
        for (id, record) in later.added {
            if let Some(prev) = self.removed.remove(&id) {
                if prev != record {
                    self.updated.insert(id, (prev, record));
                }
            } else {
                self.added.insert(id, record);
            }
        }

        for (id, (from, to)) in later.updated {
            if let Some(added) = self.added.get_mut(&id) {
                *added = to;
            } else if let Some(entry) = self.updated.get_mut(&id) {
                entry.1 = to;
            } else {
                self.updated.insert(id, (from, to));
            }
        }

        for (id, record) in later.removed {
            if self.added.remove(&id).is_some() {
                continue;
            }
            let original = match self.updated.remove(&id) {
                Some((from, _)) => from,
                None => record,
            };
            self.removed.insert(id, original);
        }
    }

    /// Drop every entry whose key is in `ids`.
    pub fn forget<'a>(&mut self, ids: impl IntoIterator<Item = &'a RecordId>) {
        for id in ids {
            self.added.remove(id);
            self.updated.remove(id);
            self.removed.remove(id);
        }
    }
}
