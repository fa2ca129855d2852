//! Inbound frame dispatch by type tag.

use std::time::Instant;

use crate::doc::SharedDoc;
use crate::error::CollabResult;
use crate::presence::{Awareness, AwarenessChange};
use crate::protocol::{split, MessageType};
use crate::publisher::ChangePublisher;

/// What an inbound frame turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A document update was merged. Map changes it caused are waiting in
    /// the document's change queue.
    Update,
    Presence(AwarenessChange),
}

/// Route one frame. Tag 0 is imported into `doc` and the publisher's
/// marker is refreshed to the post-import version, unless local changes
/// are still unsent. Tag 1 goes to `awareness` and never touches the
/// document.
///
/// Errors leave all state untouched and are the caller's to log.
pub fn route(
    frame: &[u8],
    doc: &SharedDoc,
    publisher: &mut ChangePublisher,
    awareness: &mut Awareness,
    now: Instant,
) -> CollabResult<Inbound> {
    let (msg_type, payload) = split(frame)?;
    match msg_type {
        MessageType::Update => {
            doc.import(payload)?;
            publisher.mark(doc.version());
            Ok(Inbound::Update)
        }
        MessageType::Presence => Ok(Inbound::Presence(awareness.apply(payload, now)?)),
    }
}
