//! Turns local commits into framed incremental updates.

use crate::doc::{SharedDoc, Version};
use crate::protocol::WireMessage;

/// A framed update that has not been confirmed as sent yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelta {
    pub frame: Vec<u8>,
    /// Version the marker moves to once the frame is on the wire.
    pub up_to: Version,
}

/// Tracks the last version sent to peers.
///
/// The marker is owned per session so two documents synced from the same
/// process never share it. It only moves once a frame has actually been
/// handed to the connection; a failed send leaves it behind so the next
/// publish re-covers the gap.
#[derive(Debug, Default)]
pub struct ChangePublisher {
    last_published: Version,
    /// Set between `publish` and `confirm`, and kept after a failed send.
    unconfirmed: bool,
    published: u64,
    skipped: u64,
}

impl ChangePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame every operation since the marker as a tag-0 message.
    ///
    /// Returns `None` when nothing new exists since the last confirmed
    /// publish. The marker does not move until [`confirm`](Self::confirm).
    pub fn publish(&mut self, doc: &SharedDoc) -> Option<PendingDelta> {
        let current = doc.version();
        if current == self.last_published {
            self.skipped += 1;
            return None;
        }

        let delta = doc.export_from(&self.last_published);
        self.unconfirmed = true;
        log::trace!("publishing {} byte update", delta.len());
        Some(PendingDelta {
            frame: WireMessage::update(delta).encode(),
            up_to: current,
        })
    }

    /// Record that a frame from [`publish`](Self::publish) was sent.
    pub fn confirm(&mut self, up_to: Version) {
        self.last_published = up_to;
        self.unconfirmed = false;
        self.published += 1;
    }

    /// True while local operations exist that no confirmed frame carried.
    pub fn has_unsent(&self) -> bool {
        self.unconfirmed
    }

    /// Move the marker without publishing, after an import has merged
    /// operations that peers already have.
    ///
    /// Ignored while a publish is unconfirmed: jumping ahead would skip
    /// the local operations that never made it out.
    pub fn mark(&mut self, version: Version) {
        if self.unconfirmed {
            log::debug!("marker held back, unsent local changes pending");
            return;
        }
        self.last_published = version;
    }

    pub fn last_published(&self) -> &Version {
        &self.last_published
    }

    /// Number of updates confirmed as sent.
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
