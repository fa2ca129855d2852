//! Sync session: one editor store, one shared document, one connection.
//!
//! ## Event flow
//!
//! ```text
//!  editor store ──(User batches)──► local queue ─┐
//!                                                │ handle_local_changes
//!                                                ▼
//!                              classify ─► outbound translator ──► SharedDoc
//!                                  │            ▲                     │
//!                       updates ──►│ Throttle ──┘                     │ take_changes
//!                                                                     ▼
//!                             ┌───────────── by origin ─────────────────┐
//!                             │ Local  → ChangePublisher → [0] ++ delta │──► connection
//!                             │ Import → RemoteApplier → editor store   │
//!                             └─────────────────────────────────────────┘
//!
//!  connection ──► router ─┬─ tag 0 → SharedDoc::import
//!                         └─ tag 1 → Awareness::apply
//!
//!  pointer moves ──► PresencePublisher (Throttle) ──► Awareness ──► [1] ++ delta
//! ```
//!
//! Every entry point takes `now` and runs to completion, so tests can drive a
//! session deterministically. [`SyncSession::run`] is the async loop that
//! feeds the same entry points from real channels and timers.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use easel_core::{ChangeSource, EditorStore, ListenerId, RecordsDiff, StoreChange, Vec2};

use crate::applier::RemoteApplier;
use crate::classify::is_relevant;
use crate::doc::{ChangeOrigin, SharedDoc, DEFAULT_MAP_NAME};
use crate::error::{CollabError, CollabResult};
use crate::outbound::OutboundTranslator;
use crate::presence::{Awareness, PeerIdentity, PresencePublisher, PresenceRecord};
use crate::protocol::WireMessage;
use crate::publisher::ChangePublisher;
use crate::router::{route, Inbound};
use crate::throttle::Throttle;
use crate::transport::Connection;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the shared map inside the document
    pub map_name: String,
    /// Trailing-edge window for shape-update batches
    pub update_interval: Duration,
    /// Trailing-edge window for pointer samples
    pub presence_interval: Duration,
    /// Silence after which a remote peer's presence is dropped
    pub presence_timeout: Duration,
    /// Stored display name, if the user picked one
    pub user_name: Option<String>,
    /// Fixed peer id (random when `None`)
    pub peer_id: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            map_name: DEFAULT_MAP_NAME.to_string(),
            update_interval: Duration::from_millis(120),
            presence_interval: Duration::from_millis(100),
            presence_timeout: Duration::from_secs(30),
            user_name: None,
            peer_id: None,
        }
    }
}

/// Session statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames queued on the connection, of either type
    pub messages_sent: u64,
    /// Frames the connection refused because it was full or closed
    pub messages_dropped: u64,
    /// Update frames that reached the connection
    pub deltas_published: u64,
    /// Update frames merged into the document
    pub imports: u64,
    pub remote_records_applied: u64,
    pub remote_records_removed: u64,
    /// Local presence announcements (pointer samples and renames)
    pub presence_updates: u64,
    pub presence_received: u64,
    /// Inbound frames that failed to decode or merge
    pub malformed_messages: u64,
    /// Local batches with no record the peers care about
    pub irrelevant_batches: u64,
}

#[derive(Debug)]
enum Command {
    PointerMoved(Vec2),
    SetUserName(String),
    Shutdown,
}

/// Cloneable control handle for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Report a pointer position in screen coordinates. Returns `false` if
    /// the session is gone.
    pub fn pointer_moved(&self, point: Vec2) -> bool {
        self.commands.send(Command::PointerMoved(point)).is_ok()
    }

    /// Change the display name and re-announce presence.
    pub fn set_user_name(&self, name: impl Into<String>) -> bool {
        self.commands.send(Command::SetUserName(name.into())).is_ok()
    }

    /// Ask the session to tear down and stop.
    pub fn shutdown(&self) -> bool {
        self.commands.send(Command::Shutdown).is_ok()
    }
}

/// Keeps one editor store in sync with its peers over one connection.
///
/// Local edits flow out as incremental update frames; inbound updates are
/// merged into the shared document and applied to the store as remote
/// changes. Presence travels alongside on its own frame type.
pub struct SyncSession<S: EditorStore> {
    config: SessionConfig,
    doc: SharedDoc,
    store: Arc<Mutex<S>>,
    listener: Option<ListenerId>,
    local_changes: mpsc::UnboundedReceiver<RecordsDiff>,
    connection: Connection,
    outbound: OutboundTranslator,
    publisher: ChangePublisher,
    applier: RemoteApplier,
    updates: Throttle<RecordsDiff>,
    awareness: Awareness,
    presence: PresencePublisher,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: SessionHandle,
    stats: SessionStats,
    /// When to re-send local changes whose frame could not be queued.
    publish_retry: Option<Instant>,
    finished: bool,
}

impl<S: EditorStore> SyncSession<S> {
    /// Subscribe to `store` and bind to `connection`.
    pub fn new(
        store: Arc<Mutex<S>>,
        connection: Connection,
        config: SessionConfig,
    ) -> CollabResult<Self> {
        let doc = match config.peer_id {
            Some(peer_id) => SharedDoc::with_peer_id(peer_id, &config.map_name),
            None => SharedDoc::new(&config.map_name),
        };

        // Only user edits are queued; remote merges come back tagged Remote.
        let (local_tx, local_changes) = mpsc::unbounded_channel();
        let listener = store
            .lock()
            .map_err(|_| CollabError::StorePoisoned)?
            .listen(Box::new(move |change: &StoreChange| {
                if change.source == ChangeSource::User {
                    let _ = local_tx.send(change.changes.clone());
                }
            }));

        let (command_tx, commands) = mpsc::unbounded_channel();
        let identity = PeerIdentity::new(doc.peer_id(), config.user_name.clone());
        log::info!(
            "session started for peer {} ({})",
            identity.peer_id,
            identity.user_name
        );

        Ok(Self {
            awareness: Awareness::new(doc.peer_id(), config.presence_timeout),
            presence: PresencePublisher::new(identity, config.presence_interval),
            updates: Throttle::new(config.update_interval),
            config,
            doc,
            store,
            listener: Some(listener),
            local_changes,
            connection,
            outbound: OutboundTranslator::new(),
            publisher: ChangePublisher::new(),
            applier: RemoteApplier::new(),
            commands,
            handle: SessionHandle {
                commands: command_tx,
            },
            stats: SessionStats::default(),
            publish_retry: None,
            finished: false,
        })
    }

    /// Control handle usable from other tasks while [`run`](Self::run)
    /// owns the session.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// The shared document mirroring the store's collaborative records.
    pub fn doc(&self) -> &SharedDoc {
        &self.doc
    }

    /// Peer id shared by the document and the presence lane.
    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    pub fn identity(&self) -> &PeerIdentity {
        self.presence.identity()
    }

    /// Presence of every peer this session has heard from.
    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Counters since the session was created.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// True after shutdown was requested or the transport closed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Publish every collaborative record already in the store, e.g. when
    /// a session is attached to an editor that has content.
    pub fn share_existing_records(&mut self) -> CollabResult<usize> {
        let mut diff = RecordsDiff::new();
        {
            let store = self.store.lock().map_err(|_| CollabError::StorePoisoned)?;
            for record in store_records(&*store) {
                diff.added.insert(record.id.clone(), record);
            }
        }
        let written = self.outbound.on_added(&self.doc, &diff)?;
        self.dispatch_doc_changes(Instant::now());
        Ok(written)
    }

    // ───────────────────────────────────────────────────────────────
    // Entry points
    // ───────────────────────────────────────────────────────────────

    /// React to one user-sourced change batch from the editor store.
    pub fn handle_local_changes(&mut self, diff: RecordsDiff, now: Instant) {
        if !is_relevant(&diff) {
            self.stats.irrelevant_batches += 1;
            return;
        }

        if !diff.removed.is_empty() {
            // A trailing flush must not bring back what was just deleted.
            if let Some(pending) = self.updates.pending_mut() {
                pending.forget(diff.removed.keys());
                if pending.is_empty() {
                    self.updates.cancel();
                }
            }
            self.outbound.on_removed(&self.doc, &diff.only_removed());
        }

        if !diff.added.is_empty() {
            if let Err(e) = self.outbound.on_added(&self.doc, &diff.only_added()) {
                log::warn!("failed to share added records: {e}");
            }
        }

        if !diff.updated.is_empty() {
            self.updates
                .merge(diff.only_updated(), now, |pending, later| pending.squash(later));
        }

        self.dispatch_doc_changes(now);
    }

    /// React to one frame from the connection. Failures are logged and the
    /// frame is dropped.
    pub fn handle_inbound(&mut self, frame: &[u8], now: Instant) {
        match route(frame, &self.doc, &mut self.publisher, &mut self.awareness, now) {
            Ok(Inbound::Update) => {
                self.stats.imports += 1;
                self.dispatch_doc_changes(now);
            }
            Ok(Inbound::Presence(change)) => {
                self.stats.presence_received += 1;
                if !change.is_empty() {
                    log::trace!("presence change: {change:?}");
                }
                // Newcomers learn about everyone we know, ourselves included.
                if !change.added.is_empty() && self.awareness.local_state().is_some() {
                    let snapshot = self.awareness.encode_all();
                    self.send_presence_delta(snapshot);
                }
            }
            Err(e) => {
                self.stats.malformed_messages += 1;
                log::warn!("dropping inbound message ({} bytes): {e}", frame.len());
            }
        }
    }

    /// Record a pointer position in screen coordinates.
    pub fn pointer_moved(&mut self, point: Vec2, now: Instant) {
        self.presence.pointer_moved(point, now);
    }

    /// Change the display name and re-announce presence right away.
    pub fn set_user_name(&mut self, name: String, now: Instant) {
        let record = match self.store.lock() {
            Ok(store) => self.presence.set_user_name(name, &*store),
            Err(_) => {
                log::error!("{}", CollabError::StorePoisoned);
                return;
            }
        };
        if let Some(record) = record {
            log::info!("user name changed to {}", record.user_name);
            self.publish_presence(record, now);
        }
    }

    /// Fire every throttle and presence timer that is due.
    pub fn poll_timers(&mut self, now: Instant) {
        if let Some(batch) = self.updates.poll(now) {
            self.flush_updates(batch, now);
        }

        if self.publish_retry.is_some_and(|at| now >= at) {
            log::debug!("retrying unsent local changes");
            self.publish_changes(now);
        }

        let sample = match self.store.lock() {
            Ok(store) => self.presence.poll(&*store, now),
            Err(_) => {
                log::error!("{}", CollabError::StorePoisoned);
                None
            }
        };
        if let Some(record) = sample {
            self.publish_presence(record, now);
        }

        if self.awareness.renewal_due().is_some_and(|due| now >= due) {
            if let Some(delta) = self.awareness.renew(now) {
                self.send_presence_delta(delta);
            }
        }

        let expired = self.awareness.remove_outdated(now);
        if !expired.is_empty() {
            log::debug!("dropped presence of {} silent peers", expired.len());
        }
    }

    /// The earliest instant at which [`poll_timers`](Self::poll_timers) has
    /// work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.updates.deadline(),
            self.publish_retry,
            self.presence.deadline(),
            self.awareness.renewal_due(),
            self.awareness.next_expiry(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Drain everything that has already arrived (store changes, commands,
    /// inbound frames) in order, then poll timers. Returns the number of
    /// events handled.
    pub fn process_pending(&mut self, now: Instant) -> usize {
        let mut handled = 0;

        while let Ok(diff) = self.local_changes.try_recv() {
            self.handle_local_changes(diff, now);
            handled += 1;
        }

        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command, now);
            handled += 1;
        }

        while !self.finished {
            match self.connection.try_recv() {
                Ok(Some(frame)) => {
                    self.handle_inbound(&frame, now);
                    handled += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    log::info!("transport closed");
                    self.finished = true;
                }
            }
        }

        self.poll_timers(now);
        handled
    }

    /// Run until the transport closes or [`SessionHandle::shutdown`] is
    /// called, then tear down.
    pub async fn run(mut self) -> SessionStats {
        while !self.finished {
            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                Some(diff) = self.local_changes.recv() => {
                    self.handle_local_changes(diff, Instant::now());
                }
                frame = self.connection.recv() => match frame {
                    Some(frame) => self.handle_inbound(&frame, Instant::now()),
                    None => {
                        log::info!("transport closed");
                        self.finished = true;
                    }
                },
                Some(command) = self.commands.recv() => {
                    self.handle_command(command, Instant::now());
                }
                _ = timer => self.poll_timers(Instant::now()),
            }
        }

        self.teardown(Instant::now());
        self.stats.clone()
    }

    /// Flush pending updates, announce departure and stop listening to the
    /// store. Idempotent.
    pub fn teardown(&mut self, now: Instant) {
        if let Some(batch) = self.updates.flush() {
            self.flush_updates(batch, now);
        }
        if self.publisher.has_unsent() {
            self.publish_changes(now);
        }
        self.presence.cancel();

        if self.awareness.local_state().is_some() {
            let removal = self.awareness.clear_local_state(now);
            self.send_presence_delta(removal);
        }

        self.unlisten();
        self.finished = true;
    }

    // ───────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::PointerMoved(point) => self.pointer_moved(point, now),
            Command::SetUserName(name) => self.set_user_name(name, now),
            Command::Shutdown => {
                log::info!("session shutdown requested");
                self.finished = true;
            }
        }
    }

    fn flush_updates(&mut self, batch: RecordsDiff, now: Instant) {
        let batch = match self.store.lock() {
            Ok(store) => refresh_updates(&*store, &self.doc, batch),
            Err(_) => {
                log::error!("{}; flushing buffered updates as-is", CollabError::StorePoisoned);
                batch
            }
        };
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.outbound.on_updated(&self.doc, &batch) {
            log::warn!("failed to share updated records: {e}");
        }
        self.dispatch_doc_changes(now);
    }

    /// Drain queued map changes and dispatch each by origin.
    fn dispatch_doc_changes(&mut self, now: Instant) {
        for change in self.doc.take_changes() {
            match change.by {
                ChangeOrigin::Local => self.publish_changes(now),
                ChangeOrigin::Import => {
                    let mut store = match self.store.lock() {
                        Ok(store) => store,
                        Err(_) => {
                            log::error!("{}; remote change not applied", CollabError::StorePoisoned);
                            continue;
                        }
                    };
                    let applied = self.applier.apply(&mut *store, &change);
                    self.stats.remote_records_applied +=
                        (applied.added.len() + applied.updated.len()) as u64;
                    self.stats.remote_records_removed += applied.removed.len() as u64;
                }
                ChangeOrigin::Other => {
                    log::trace!("ignoring map change of unknown origin");
                }
            }
        }
    }

    /// Send everything since the publisher's marker. The marker only moves
    /// once the frame is queued; otherwise a retry is scheduled one update
    /// window out.
    fn publish_changes(&mut self, now: Instant) {
        let Some(pending) = self.publisher.publish(&self.doc) else {
            self.publish_retry = None;
            return;
        };
        match self.connection.send(pending.frame) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                self.stats.deltas_published += 1;
                self.publisher.confirm(pending.up_to);
                self.publish_retry = None;
            }
            Err(e) => {
                self.stats.messages_dropped += 1;
                log::warn!("update not sent, will retry: {e}");
                self.publish_retry = Some(now + self.config.update_interval);
            }
        }
    }

    fn publish_presence(&mut self, record: PresenceRecord, now: Instant) {
        match self.awareness.set_local_state(record, now) {
            Ok(delta) => {
                self.stats.presence_updates += 1;
                self.send(WireMessage::presence(delta).encode());
            }
            Err(e) => log::warn!("failed to encode presence: {e}"),
        }
    }

    fn send_presence_delta(&mut self, delta: CollabResult<Vec<u8>>) {
        match delta {
            Ok(delta) => self.send(WireMessage::presence(delta).encode()),
            Err(e) => log::warn!("failed to encode presence: {e}"),
        }
    }

    fn send(&mut self, frame: Vec<u8>) {
        match self.connection.send(frame) {
            Ok(()) => self.stats.messages_sent += 1,
            Err(e) => {
                self.stats.messages_dropped += 1;
                log::warn!("frame not sent: {e}");
            }
        }
    }

    fn unlisten(&mut self) {
        let Some(id) = self.listener.take() else {
            return;
        };
        match self.store.lock() {
            Ok(mut store) => {
                store.unlisten(id);
            }
            Err(_) => log::error!("{}; listener not removed", CollabError::StorePoisoned),
        }
    }
}

impl<S: EditorStore> Drop for SyncSession<S> {
    fn drop(&mut self) {
        self.unlisten();
    }
}

/// Replace the `to` side of buffered updates with the store's current
/// record, which may have moved on through a remote merge since the batch
/// was buffered. Records that no longer exist are dropped, and so are
/// records whose JSON already matches the shared map.
fn refresh_updates<S: EditorStore>(
    store: &S,
    doc: &SharedDoc,
    mut batch: RecordsDiff,
) -> RecordsDiff {
    batch.updated.retain(|id, (_, to)| {
        let Some(current) = store.record(id.as_str()) else {
            return false;
        };
        let shared = doc.get(id.as_str());
        if shared.is_some() && current.to_json().ok() == shared {
            log::trace!("{id} already matches the shared map");
            return false;
        }
        *to = current;
        true
    });
    batch
}

/// Every collaborative record currently held by `store`.
fn store_records<S: EditorStore>(store: &S) -> Vec<easel_core::Record> {
    store
        .snapshot()
        .into_iter()
        .filter(crate::classify::record_is_collaborative)
        .collect()
}
