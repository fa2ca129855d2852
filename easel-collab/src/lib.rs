//! # easel-collab - real-time sync for the Easel whiteboard
//!
//! Keeps an editor's record store consistent with a shared Yrs document
//! and carries ephemeral presence over the same connection.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  User batches   ┌──────────────┐  [0] ++ delta  ┌────────────┐
//! │ EditorStore  │ ───────────────►│ SyncSession  │ ─────────────► │            │
//! │ (easel-core) │ ◄───────────────│  SharedDoc   │ ◄───────────── │ RelayServer│
//! └──────────────┘  Remote merge   │  Awareness   │  [1] ++ delta  │  (rooms)   │
//!                                  └──────────────┘                └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - one-byte type tag framing
//! - [`classify`] - which change batches matter to peers
//! - [`outbound`] - local batches → shared map writes
//! - [`throttle`] - trailing-edge rate limiting
//! - [`doc`] - the shared Yrs document and its origin-tagged change queue
//! - [`publisher`] - local commits → incremental update frames
//! - [`applier`] - imported changes → remote editor transactions
//! - [`router`] - inbound frame dispatch
//! - [`presence`] - awareness state and pointer publishing
//! - [`session`] - the event loop wiring all of the above
//! - [`transport`] - WebSocket and in-memory connections
//! - [`broadcast`], [`server`] - the relay

pub mod applier;
pub mod broadcast;
pub mod classify;
pub mod doc;
pub mod error;
pub mod outbound;
pub mod presence;
pub mod protocol;
pub mod publisher;
pub mod router;
pub mod server;
pub mod session;
pub mod throttle;
pub mod transport;

pub use applier::{ApplierStats, RemoteApplier};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use doc::{
    ChangeOrigin, EntryDiff, EntryValue, LocalTransaction, MapChange, SharedDoc, Version,
    DEFAULT_MAP_NAME,
};
pub use error::{CollabError, CollabResult};
pub use outbound::{OutboundStats, OutboundTranslator};
pub use presence::{
    Awareness, AwarenessChange, AwarenessEntry, PeerIdentity, PresencePosition,
    PresencePublisher, PresenceRecord,
};
pub use protocol::{MessageType, WireMessage};
pub use publisher::{ChangePublisher, PendingDelta};
pub use router::{route, Inbound};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use session::{SessionConfig, SessionHandle, SessionStats, SyncSession};
pub use throttle::Throttle;
pub use transport::Connection;
