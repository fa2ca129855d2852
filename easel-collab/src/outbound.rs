//! Local editor changes → shared map writes.
//!
//! Each handler opens one local transaction, writes the surviving records
//! and commits. The commit is the unit that the change publisher turns
//! into exactly one outgoing update.

use easel_core::RecordsDiff;

use crate::classify::record_is_collaborative;
use crate::doc::SharedDoc;
use crate::error::CollabResult;

/// Counters for translated writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundStats {
    pub written: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub commits: u64,
}

#[derive(Debug, Default)]
pub struct OutboundTranslator {
    stats: OutboundStats,
}

impl OutboundTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write every collaborative added record.
    pub fn on_added(&mut self, doc: &SharedDoc, diff: &RecordsDiff) -> CollabResult<usize> {
        self.write(doc, diff.added.values())
    }

    /// Write the `to` side of every collaborative updated record.
    pub fn on_updated(&mut self, doc: &SharedDoc, diff: &RecordsDiff) -> CollabResult<usize> {
        self.write(doc, diff.updated.values().map(|(_, to)| to))
    }

    /// Delete every removed key. Removals are not filtered by kind.
    pub fn on_removed(&mut self, doc: &SharedDoc, diff: &RecordsDiff) -> usize {
        let mut txn = doc.transact();
        for id in diff.removed.keys() {
            if !txn.delete(id.as_str()) {
                log::trace!("remove of {id} not present in shared map");
            }
        }
        let deleted = txn.commit();
        self.stats.deleted += deleted as u64;
        self.stats.commits += 1;
        deleted
    }

    pub fn stats(&self) -> &OutboundStats {
        &self.stats
    }

    fn write<'a>(
        &mut self,
        doc: &SharedDoc,
        records: impl Iterator<Item = &'a easel_core::Record>,
    ) -> CollabResult<usize> {
        // Serialize before opening the transaction so a failure leaves the
        // document untouched.
        let mut encoded = Vec::new();
        for record in records {
            if !record_is_collaborative(record) {
                log::trace!("skipping local-only record {}", record.id);
                self.stats.skipped += 1;
                continue;
            }
            encoded.push((record.id.as_str(), record.to_json()?));
        }

        let mut txn = doc.transact();
        for (key, json) in encoded {
            txn.put(key, json);
        }
        let written = txn.commit();
        self.stats.written += written as u64;
        self.stats.commits += 1;
        Ok(written)
    }
}
