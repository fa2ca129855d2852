//! Presence: per-peer cursor and identity awareness.
//!
//! ## Architecture
//!
//! ```text
//! pointer move (screen coords)
//!       │
//!       ▼
//! PresencePublisher ── Throttle<Vec2> (trailing edge)
//!       │  screen_to_page + zoom + identity
//!       ▼
//! Awareness::set_local_state()  ──► delta bytes ──► [1] ++ delta
//!                                                        │
//!                                                (transport)
//!                                                        │
//! remote Awareness::apply() ◄────────────────────────────┘
//!       │  last-write-wins per peer (clock)
//!       ▼
//! AwarenessChange { added, updated, removed }
//! ```
//!
//! Deltas are bincode-encoded lists of `(peer_id, clock, state)` entries.
//! A `None` state announces that the peer left. Presence never enters the
//! shared document.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use easel_core::{EditorStore, Vec2};

use crate::error::{CollabError, CollabResult};
use crate::throttle::Throttle;

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

/// Pointer position in page coordinates plus the sender's zoom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresencePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Ephemeral state one peer shares with the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub position: PresencePosition,
    pub user_id: String,
    pub user_name: String,
}

/// One peer's entry in a presence delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub peer_id: u64,
    pub clock: u64,
    /// `None` means the peer left.
    pub state: Option<PresenceRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct AwarenessDelta {
    entries: Vec<AwarenessEntry>,
}

/// Encode entries as presence delta bytes.
pub fn encode_entries(entries: Vec<AwarenessEntry>) -> CollabResult<Vec<u8>> {
    bincode::serde::encode_to_vec(AwarenessDelta { entries }, bincode::config::standard())
        .map_err(|e| CollabError::Presence(e.to_string()))
}

/// Decode presence delta bytes.
pub fn decode_entries(bytes: &[u8]) -> CollabResult<Vec<AwarenessEntry>> {
    let (delta, _): (AwarenessDelta, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Presence(e.to_string()))?;
    Ok(delta.entries)
}

// ───────────────────────────────────────────────────────────────────
// Awareness state
// ───────────────────────────────────────────────────────────────────

/// Peers whose state changed after applying one delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PeerState {
    clock: u64,
    record: Option<PresenceRecord>,
    last_seen: Instant,
}

/// Presence state of every peer in a room, including the local one.
pub struct Awareness {
    local_peer: u64,
    local_clock: u64,
    local_state: Option<PresenceRecord>,
    local_updated: Option<Instant>,
    /// Remote peers. Departed peers stay as `record: None` so a stale
    /// state cannot bring them back.
    peers: HashMap<u64, PeerState>,
    timeout: Duration,
}

impl Awareness {
    pub fn new(local_peer: u64, timeout: Duration) -> Self {
        Self {
            local_peer,
            local_clock: 0,
            local_state: None,
            local_updated: None,
            peers: HashMap::new(),
            timeout,
        }
    }

    pub fn local_peer(&self) -> u64 {
        self.local_peer
    }

    pub fn local_state(&self) -> Option<&PresenceRecord> {
        self.local_state.as_ref()
    }

    /// Replace the local state and return the delta announcing it.
    pub fn set_local_state(&mut self, record: PresenceRecord, now: Instant) -> CollabResult<Vec<u8>> {
        self.local_state = Some(record);
        self.bump_local(now)
    }

    /// Announce that the local peer left.
    pub fn clear_local_state(&mut self, now: Instant) -> CollabResult<Vec<u8>> {
        self.local_state = None;
        self.bump_local(now)
    }

    /// Re-announce the current local state so peers do not time it out.
    pub fn renew(&mut self, now: Instant) -> Option<CollabResult<Vec<u8>>> {
        self.local_state.as_ref()?;
        Some(self.bump_local(now))
    }

    /// When the local state should next be re-announced: half the timeout
    /// after the last announcement.
    pub fn renewal_due(&self) -> Option<Instant> {
        self.local_state.as_ref()?;
        self.local_updated.map(|at| at + self.timeout / 2)
    }

    /// Merge a delta received from a peer.
    pub fn apply(&mut self, bytes: &[u8], now: Instant) -> CollabResult<AwarenessChange> {
        let entries = decode_entries(bytes)?;
        let mut change = AwarenessChange::default();

        for entry in entries {
            if entry.peer_id == self.local_peer {
                continue;
            }

            match self.peers.get_mut(&entry.peer_id) {
                Some(known) if entry.clock <= known.clock => {
                    log::trace!(
                        "stale presence from {} (clock {} <= {})",
                        entry.peer_id,
                        entry.clock,
                        known.clock
                    );
                }
                Some(known) => {
                    let was_present = known.record.is_some();
                    known.clock = entry.clock;
                    known.last_seen = now;
                    match (was_present, entry.state) {
                        (true, None) => {
                            known.record = None;
                            change.removed.push(entry.peer_id);
                        }
                        (true, Some(record)) => {
                            if known.record.as_ref() != Some(&record) {
                                change.updated.push(entry.peer_id);
                            }
                            known.record = Some(record);
                        }
                        (false, Some(record)) => {
                            known.record = Some(record);
                            change.added.push(entry.peer_id);
                        }
                        (false, None) => {}
                    }
                }
                None => {
                    if entry.state.is_some() {
                        change.added.push(entry.peer_id);
                    }
                    self.peers.insert(
                        entry.peer_id,
                        PeerState {
                            clock: entry.clock,
                            record: entry.state,
                            last_seen: now,
                        },
                    );
                }
            }
        }

        Ok(change)
    }

    /// Mark peers not heard from within the timeout as departed. Returns the
    /// ids of peers that were still present.
    ///
    /// Departed peers keep their clock for one more timeout so a stale
    /// state relayed late is still rejected; after that they are forgotten.
    pub fn remove_outdated(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.timeout;
        let mut removed = Vec::new();
        for (peer_id, state) in self.peers.iter_mut() {
            let expired = now.saturating_duration_since(state.last_seen) >= timeout;
            if expired && state.record.is_some() {
                state.record = None;
                state.last_seen = now;
                removed.push(*peer_id);
            }
        }
        self.peers
            .retain(|_, state| now.saturating_duration_since(state.last_seen) < timeout);
        if !removed.is_empty() {
            removed.sort_unstable();
            log::debug!("presence timed out for peers {removed:?}");
        }
        removed
    }

    /// Earliest instant at which [`remove_outdated`](Self::remove_outdated)
    /// has something to do, either a timeout or a departed peer to forget.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.peers.values().map(|p| p.last_seen + self.timeout).min()
    }

    /// Encode every known present state, the local one included.
    pub fn encode_all(&self) -> CollabResult<Vec<u8>> {
        let mut entries: Vec<AwarenessEntry> = self
            .peers
            .iter()
            .filter(|(_, p)| p.record.is_some())
            .map(|(peer_id, p)| AwarenessEntry {
                peer_id: *peer_id,
                clock: p.clock,
                state: p.record.clone(),
            })
            .collect();
        if let Some(local) = &self.local_state {
            entries.push(AwarenessEntry {
                peer_id: self.local_peer,
                clock: self.local_clock,
                state: Some(local.clone()),
            });
        }
        entries.sort_by_key(|e| e.peer_id);
        encode_entries(entries)
    }

    /// State of a remote peer, if present.
    pub fn peer(&self, peer_id: u64) -> Option<&PresenceRecord> {
        self.peers.get(&peer_id)?.record.as_ref()
    }

    /// Present remote peers.
    pub fn peers(&self) -> impl Iterator<Item = (u64, &PresenceRecord)> {
        self.peers
            .iter()
            .filter_map(|(id, p)| p.record.as_ref().map(|r| (*id, r)))
    }

    pub fn peer_count(&self) -> usize {
        self.peers().count()
    }

    fn bump_local(&mut self, now: Instant) -> CollabResult<Vec<u8>> {
        self.local_clock += 1;
        self.local_updated = Some(now);
        encode_entries(vec![AwarenessEntry {
            peer_id: self.local_peer,
            clock: self.local_clock,
            state: self.local_state.clone(),
        }])
    }
}

// ───────────────────────────────────────────────────────────────────
// Identity and publishing
// ───────────────────────────────────────────────────────────────────

/// Who the local peer is to others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub peer_id: u64,
    pub user_name: String,
}

impl PeerIdentity {
    /// Use `user_name` if given and not blank, otherwise a name derived
    /// from the peer id.
    pub fn new(peer_id: u64, user_name: Option<String>) -> Self {
        let user_name = user_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| Self::default_name(peer_id));
        Self { peer_id, user_name }
    }

    pub fn default_name(peer_id: u64) -> String {
        let id = peer_id.to_string();
        format!("User {}", id.chars().take(4).collect::<String>())
    }
}

/// Samples throttled pointer moves into presence records.
pub struct PresencePublisher {
    identity: PeerIdentity,
    pointer: Throttle<Vec2>,
    last_pointer: Option<Vec2>,
}

impl PresencePublisher {
    pub fn new(identity: PeerIdentity, interval: Duration) -> Self {
        Self {
            identity,
            pointer: Throttle::new(interval),
            last_pointer: None,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Record a pointer move in screen coordinates.
    pub fn pointer_moved(&mut self, screen: Vec2, now: Instant) {
        self.pointer.push(screen, now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pointer.deadline()
    }

    /// The record to publish if the pointer window has elapsed.
    pub fn poll<S: EditorStore>(&mut self, store: &S, now: Instant) -> Option<PresenceRecord> {
        let screen = self.pointer.poll(now)?;
        self.last_pointer = Some(screen);
        Some(self.record_at(store, screen))
    }

    /// Change the display name. Returns the record to publish right away,
    /// at the last known pointer position (origin if none yet). Returns
    /// `None` if the name did not change.
    pub fn set_user_name<S: EditorStore>(&mut self, name: String, store: &S) -> Option<PresenceRecord> {
        let next = PeerIdentity::new(self.identity.peer_id, Some(name));
        if next == self.identity {
            return None;
        }
        self.identity = next;
        let screen = self.last_pointer.unwrap_or(Vec2::ZERO);
        Some(self.record_at(store, screen))
    }

    pub fn cancel(&mut self) {
        self.pointer.cancel();
    }

    /// Pointer samples collapsed into a later one.
    pub fn coalesced(&self) -> u64 {
        self.pointer.coalesced()
    }

    fn record_at<S: EditorStore>(&self, store: &S, screen: Vec2) -> PresenceRecord {
        let page = store.screen_to_page(screen);
        PresenceRecord {
            position: PresencePosition {
                x: page.x,
                y: page.y,
                z: store.zoom(),
            },
            user_id: self.identity.peer_id.to_string(),
            user_name: self.identity.user_name.clone(),
        }
    }
}
