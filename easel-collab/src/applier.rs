//! Imported map changes → one remote-sourced editor transaction.
//!
//! The applier is the only writer of the editor store for imported data.
//! It goes through [`EditorStore::merge_remote_changes`], which tags the
//! resulting batch [`ChangeSource::Remote`](easel_core::ChangeSource), so
//! the session's store listener never feeds it back into the shared map.

use easel_core::{EditorStore, Record, RecordId, RecordsDiff};

use crate::doc::{EntryValue, MapChange};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplierStats {
    pub upserted: u64,
    pub removed: u64,
    /// Entries whose JSON did not decode as a record.
    pub undecodable: u64,
    pub transactions: u64,
}

#[derive(Debug, Default)]
pub struct RemoteApplier {
    stats: ApplierStats,
}

impl RemoteApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every entry of `change` to `store` as a single remote
    /// transaction: upserts first, then removals.
    pub fn apply<S: EditorStore>(&mut self, store: &mut S, change: &MapChange) -> RecordsDiff {
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();

        for entry in &change.entries {
            match &entry.value {
                EntryValue::Deleted => deletes.push(RecordId::from(entry.key.as_str())),
                EntryValue::Json(json) => match Record::from_json(json) {
                    Ok(mut record) => {
                        if record.id.as_str() != entry.key {
                            log::warn!(
                                "record id {} stored under key {}; using the key",
                                record.id,
                                entry.key
                            );
                            record.id = RecordId::from(entry.key.as_str());
                        }
                        upserts.push(record);
                    }
                    Err(e) => {
                        log::warn!("skipping undecodable record {}: {e}", entry.key);
                        self.stats.undecodable += 1;
                    }
                },
            }
        }

        if upserts.is_empty() && deletes.is_empty() {
            return RecordsDiff::new();
        }

        let (upsert_count, delete_count) = (upserts.len(), deletes.len());
        let diff = store.merge_remote_changes(|txn| {
            txn.put(upserts);
            txn.remove(deletes);
        });
        self.stats.upserted += upsert_count as u64;
        self.stats.removed += delete_count as u64;
        self.stats.transactions += 1;
        log::debug!("applied remote change: {upsert_count} upserts, {delete_count} removals");
        diff
    }

    pub fn stats(&self) -> &ApplierStats {
        &self.stats
    }
}
