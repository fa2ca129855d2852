//! WebSocket relay with path-based rooms.
//!
//! Architecture:
//! ```text
//! ws://host/<room>
//!
//! Peer A ──┐
//!          ├── Room ── Yrs Doc (authoritative) ── BroadcastGroup
//! Peer B ──┘                                           │
//!                                          ┌───────────┼───────────┐
//!                                          ▼           ▼           ▼
//!                                       Peer A      Peer B      Peer C
//! ```
//!
//! Frames are relayed unchanged to every other peer in the room. Tag-0
//! frames are also merged into the room's document, so a peer that joins
//! late first receives `[0] ++ full state`. The relay remembers the last
//! presence peer id seen on each connection and announces its departure
//! when the connection drops. A peer whose broadcast receiver lags is sent
//! the full state again; dropped presence frames are left to renewal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::error::{CollabError, CollabResult};
use crate::presence::{decode_entries, encode_entries, AwarenessEntry};
use crate::protocol::{split, MessageType, WireMessage};

/// Room used when a peer connects to `/`.
pub const DEFAULT_ROOM: &str = "default";

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Connections turned away because their room was full
    pub rejected_connections: u64,
    /// Binary frames received from peers
    pub total_frames: u64,
    pub total_bytes: u64,
    /// Frames that failed to decode or merge and were not relayed
    pub malformed_frames: u64,
    /// Broadcast frames skipped by peers that could not keep up
    pub lagged_frames: u64,
    /// Full-state frames sent to peers that fell behind the broadcast buffer
    pub resyncs: u64,
    pub active_rooms: usize,
}

/// Room: authoritative document + fan-out.
struct Room {
    doc: yrs::Doc,
    broadcast: Arc<BroadcastGroup>,
}

impl Room {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    fn import(&self, payload: &[u8]) -> CollabResult<()> {
        let update =
            Update::decode_v1(payload).map_err(|e| CollabError::UpdateDecode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::UpdateApply(e.to_string()))?;
        Ok(())
    }

    /// Full state as a tag-0 frame, or `None` for an empty document.
    fn state_frame(&self) -> Option<Vec<u8>> {
        let txn = self.doc.transact();
        if txn.state_vector().is_empty() {
            return None;
        }
        let state = txn.encode_state_as_update_v1(&StateVector::default());
        Some(WireMessage::update(state).encode())
    }
}

type Rooms = Arc<RwLock<HashMap<String, Room>>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Create a relay with no rooms. Nothing is bound until
    /// [`run`](Self::run) or [`serve`](Self::serve).
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    /// Relay on `127.0.0.1:9090` with [`RelayConfig::default`].
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind to the configured address and serve until the listener fails.
    pub async fn run(&self) -> CollabResult<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> CollabResult<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> CollabResult<()> {
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                path = req.uri().path().to_string();
                Ok(resp)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let room_name = room_from_path(&path);
        let conn_id = Uuid::new_v4();

        // Join the room.
        let (group, mut broadcast_rx, state_frame) = {
            let mut rooms_w = rooms.write().await;
            let room = rooms_w
                .entry(room_name.clone())
                .or_insert_with(|| Room::new(config.broadcast_capacity));

            let peers = room.broadcast.peer_count().await;
            if peers >= config.max_peers_per_room {
                if peers == 0 {
                    rooms_w.remove(&room_name);
                }
                drop(rooms_w);
                log::warn!("room {room_name} is full; rejecting {addr}");
                stats.write().await.rejected_connections += 1;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }

            let rx = room.broadcast.add_peer(conn_id).await;
            let state = room.state_frame();
            let group = room.broadcast.clone();
            let room_count = rooms_w.len();
            drop(rooms_w);

            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = room_count;
            (group, rx, state)
        };
        log::info!("peer {conn_id} from {addr} joined room {room_name}");

        if let Some(frame) = state_frame {
            ws_sender.send(Message::Binary(frame.into())).await?;
        }

        // Last presence entry announced on this connection: (peer id, clock).
        let mut presence: Option<(u64, u64)> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes = data.to_vec();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let accepted = match split(&bytes) {
                                Ok((MessageType::Update, payload)) => {
                                    let rooms_r = rooms.read().await;
                                    match rooms_r.get(&room_name) {
                                        Some(room) => room.import(payload),
                                        None => Err(CollabError::ConnectionClosed),
                                    }
                                }
                                Ok((MessageType::Presence, payload)) => {
                                    decode_entries(payload).map(|entries| {
                                        track_presence(&mut presence, &entries);
                                    })
                                }
                                Err(e) => Err(e),
                            };

                            match accepted {
                                Ok(()) => {
                                    group.broadcast(conn_id, bytes);
                                }
                                Err(e) => {
                                    log::warn!("dropping frame from {conn_id}: {e}");
                                    stats.write().await.malformed_frames += 1;
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                received = broadcast_rx.recv() => {
                    match forward(received, conn_id, &room_name, &rooms, &stats).await {
                        Forward::Send(frame) => {
                            if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                                log::error!("send to {conn_id} failed: {e}");
                                break;
                            }
                        }
                        Forward::Skip => {}
                        Forward::Stop => break,
                    }
                }
            }
        }

        // Cleanup: leave the room, announce departure, drop empty rooms.
        let mut rooms_w = rooms.write().await;
        group.remove_peer(&conn_id).await;

        if let Some((peer_id, clock)) = presence {
            match encode_entries(vec![AwarenessEntry {
                peer_id,
                clock: clock + 1,
                state: None,
            }]) {
                Ok(delta) => {
                    group.broadcast(Uuid::nil(), WireMessage::presence(delta).encode());
                }
                Err(e) => log::warn!("failed to encode departure of {peer_id}: {e}"),
            }
        }

        if group.peer_count().await == 0 {
            rooms_w.remove(&room_name);
            log::info!("room {room_name} removed (empty)");
        }

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = rooms_w.len();
        Ok(())
    }

    /// Snapshot of the counters across all rooms.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Rooms with at least one connected peer.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Connected peers in `room`, 0 if it does not exist.
    pub async fn room_peers(&self, room: &str) -> usize {
        let group = {
            let rooms = self.rooms.read().await;
            match rooms.get(room) {
                Some(r) => r.broadcast.clone(),
                None => return 0,
            }
        };
        group.peer_count().await
    }

    /// Address from the configuration; with [`serve`](Self::serve) the
    /// listener's real address may differ.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// What the forwarder does with one broadcast receive.
#[derive(Debug, PartialEq, Eq)]
enum Forward {
    Send(Vec<u8>),
    Skip,
    Stop,
}

/// Turn one broadcast receive into a frame for this connection. Own frames
/// are skipped. After a lag the room's full state stands in for the
/// dropped frames.
async fn forward(
    received: Result<Arc<Envelope>, broadcast::error::RecvError>,
    conn_id: Uuid,
    room_name: &str,
    rooms: &Rooms,
    stats: &RwLock<RelayStats>,
) -> Forward {
    match received {
        Ok(envelope) if envelope.from == conn_id => Forward::Skip,
        Ok(envelope) => Forward::Send(envelope.bytes.clone()),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            log::warn!("peer {conn_id} lagged by {n} frames; resending room state");
            {
                let mut s = stats.write().await;
                s.lagged_frames += n;
                s.resyncs += 1;
            }
            let state = rooms.read().await.get(room_name).and_then(Room::state_frame);
            match state {
                Some(frame) => Forward::Send(frame),
                None => Forward::Skip,
            }
        }
        Err(broadcast::error::RecvError::Closed) => Forward::Stop,
    }
}

/// Room name from a request path: `/board-1` → `board-1`, `/` → default.
pub fn room_from_path(path: &str) -> String {
    let name = path.trim_matches('/');
    if name.is_empty() {
        DEFAULT_ROOM.to_string()
    } else {
        name.to_string()
    }
}

/// Remember the newest presence entry of the peer behind a connection; a
/// departure clears it. Once a peer id is known, entries for other peers
/// (re-announced snapshots) are ignored.
fn track_presence(current: &mut Option<(u64, u64)>, entries: &[AwarenessEntry]) {
    for entry in entries {
        match (&entry.state, *current) {
            (_, Some((peer, _))) if peer != entry.peer_id => {}
            (Some(_), Some((_, clock))) if entry.clock <= clock => {}
            (Some(_), _) => *current = Some((entry.peer_id, entry.clock)),
            (None, Some(_)) => *current = None,
            (None, None) => {}
        }
    }
}
