//! Integration tests for end-to-end sync through the relay.
//!
//! These tests start a real relay on a free port and connect real
//! WebSocket clients, verifying the full pipeline.

use easel_collab::presence::decode_entries;
use easel_collab::protocol::WireMessage;
use easel_collab::{
    Connection, RelayConfig, RelayServer, SessionConfig, SharedDoc, SyncSession,
    DEFAULT_MAP_NAME,
};
use easel_core::{Record, RecordStore};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};

type Store = Arc<Mutex<RecordStore>>;

/// Start a relay on a free port, return it and its base URL.
async fn start_relay(config: RelayConfig) -> (Arc<RelayServer>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RelayServer::new(RelayConfig {
        bind_addr: addr.to_string(),
        ..config
    }));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://{addr}"))
}

async fn join(url: &str, peer_id: u64) -> (Store, SyncSession<RecordStore>) {
    let connection = Connection::connect(url).await.unwrap();
    let store = Arc::new(Mutex::new(RecordStore::new()));
    let config = SessionConfig {
        peer_id: Some(peer_id),
        ..SessionConfig::default()
    };
    let session = SyncSession::new(store.clone(), connection, config).unwrap();
    (store, session)
}

/// Pump every session until `done` holds, for at most five seconds.
async fn pump_until(
    sessions: &mut [&mut SyncSession<RecordStore>],
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        for session in sessions.iter_mut() {
            session.process_pending(Instant::now());
        }
        if done() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_peers(server: &RelayServer, room: &str, peers: usize) {
    timeout(Duration::from_secs(5), async {
        while server.room_peers(room).await != peers {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peers should join the room");
}

fn update_frame(peer_id: u64, record: &Record) -> Vec<u8> {
    let doc = SharedDoc::with_peer_id(peer_id, DEFAULT_MAP_NAME);
    let mut txn = doc.transact();
    txn.put(record.id.as_str(), record.to_json().unwrap());
    txn.commit();
    WireMessage::update(doc.export_all()).encode()
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let _conn = Connection::connect(&format!("{url}/board")).await.unwrap();
    wait_for_peers(&server, "board", 1).await;
    assert_eq!(server.stats().await.total_connections, 1);
}

#[tokio::test]
async fn test_two_sessions_sync_through_relay() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let (store_a, mut a) = join(&format!("{url}/board"), 1).await;
    let (store_b, mut b) = join(&format!("{url}/board"), 2).await;
    wait_for_peers(&server, "board", 2).await;

    store_a.lock().unwrap().put([Record::shape("shape:s1", 1.0, 2.0)]);
    let arrived = pump_until(&mut [&mut a, &mut b], || {
        store_b.lock().unwrap().contains("shape:s1")
    })
    .await;
    assert!(arrived, "B should receive A's shape");

    store_b
        .lock()
        .unwrap()
        .update(&"shape:s1".into(), |r| r.set_prop("x", 50.0))
        .unwrap();
    let arrived = pump_until(&mut [&mut a, &mut b], || {
        store_a.lock().unwrap().get("shape:s1").and_then(|r| r.prop("x").cloned())
            == Some(serde_json::json!(50.0))
    })
    .await;
    assert!(arrived, "A should receive B's move after the throttle window");

    assert_eq!(a.doc().entries(), b.doc().entries());
    assert_eq!(a.stats().malformed_messages, 0);
}

#[tokio::test]
async fn test_late_joiner_receives_room_state() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let (store_a, mut a) = join(&format!("{url}/board"), 1).await;
    wait_for_peers(&server, "board", 1).await;

    store_a.lock().unwrap().put([
        Record::shape("shape:a", 0.0, 0.0),
        Record::shape("shape:b", 5.0, 5.0),
    ]);
    a.process_pending(Instant::now());
    timeout(Duration::from_secs(5), async {
        while server.stats().await.total_frames == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let (store_c, mut c) = join(&format!("{url}/board"), 3).await;
    let arrived = pump_until(&mut [&mut a, &mut c], || {
        let store = store_c.lock().unwrap();
        store.contains("shape:a") && store.contains("shape:b")
    })
    .await;
    assert!(arrived, "late joiner should receive the room state");
    assert_eq!(c.stats().messages_sent, 0);
}

#[tokio::test]
async fn test_departure_is_announced() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let (_store_a, mut a) = join(&format!("{url}/board"), 1).await;
    let (_store_b, mut b) = join(&format!("{url}/board"), 2).await;
    wait_for_peers(&server, "board", 2).await;

    a.set_user_name("Ada".to_string(), Instant::now());
    let deadline = Instant::now() + Duration::from_secs(5);
    while b.awareness().peer_count() == 0 && Instant::now() < deadline {
        b.process_pending(Instant::now());
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.awareness().peer(1).map(|p| p.user_name.clone()), Some("Ada".into()));

    // A vanishes without a clean teardown.
    drop(a);
    let deadline = Instant::now() + Duration::from_secs(5);
    while b.awareness().peer_count() > 0 && Instant::now() < deadline {
        b.process_pending(Instant::now());
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.awareness().peer_count(), 0);
    wait_for_peers(&server, "board", 1).await;
}

#[tokio::test]
async fn test_malformed_frames_are_not_relayed() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let a = Connection::connect(&format!("{url}/board")).await.unwrap();
    let mut b = Connection::connect(&format!("{url}/board")).await.unwrap();
    wait_for_peers(&server, "board", 2).await;

    let valid = update_frame(9, &Record::shape("shape:ok", 1.0, 1.0));
    a.send(Vec::new()).unwrap();
    a.send(vec![9, 1, 2]).unwrap();
    a.send(vec![0, 0xFF, 0xFF, 0xFF]).unwrap();
    a.send(vec![1, 0xFF]).unwrap();
    a.send(valid.clone()).unwrap();

    let first = timeout(Duration::from_secs(5), b.recv()).await.unwrap().unwrap();
    assert_eq!(first, valid);

    let stats = server.stats().await;
    assert_eq!(stats.malformed_frames, 4);
    assert_eq!(stats.total_frames, 5);
}

#[tokio::test]
async fn test_frames_are_not_echoed() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let mut a = Connection::connect(&format!("{url}/board")).await.unwrap();
    let mut b = Connection::connect(&format!("{url}/board")).await.unwrap();
    wait_for_peers(&server, "board", 2).await;

    let frame = update_frame(4, &Record::shape("shape:x", 0.0, 0.0));
    a.send(frame.clone()).unwrap();
    assert_eq!(timeout(Duration::from_secs(5), b.recv()).await.unwrap(), Some(frame));
    assert!(timeout(Duration::from_millis(200), a.recv()).await.is_err());
}

#[tokio::test]
async fn test_presence_frames_are_relayed_verbatim() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let a = Connection::connect(&format!("{url}/board")).await.unwrap();
    let mut b = Connection::connect(&format!("{url}/board")).await.unwrap();
    wait_for_peers(&server, "board", 2).await;

    let mut awareness = easel_collab::Awareness::new(12, Duration::from_secs(30));
    let delta = awareness
        .set_local_state(
            easel_collab::PresenceRecord {
                position: easel_collab::PresencePosition { x: 1.0, y: 1.0, z: 1.0 },
                user_id: "12".into(),
                user_name: "Lin".into(),
            },
            Instant::now(),
        )
        .unwrap();
    let frame = WireMessage::presence(delta).encode();
    a.send(frame.clone()).unwrap();

    let got = timeout(Duration::from_secs(5), b.recv()).await.unwrap().unwrap();
    assert_eq!(got, frame);

    // Dropping A makes the relay announce its departure.
    drop(a);
    let departure = timeout(Duration::from_secs(5), b.recv()).await.unwrap().unwrap();
    assert_eq!(departure[0], 1);
    let entries = decode_entries(&departure[1..]).unwrap();
    assert_eq!(entries[0].peer_id, 12);
    assert_eq!(entries[0].clock, 2);
    assert!(entries[0].state.is_none());
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let (store_a, mut a) = join(&format!("{url}/one"), 1).await;
    let (store_b, mut b) = join(&format!("{url}/two"), 2).await;
    wait_for_peers(&server, "one", 1).await;
    wait_for_peers(&server, "two", 1).await;
    assert_eq!(server.room_count().await, 2);

    store_a.lock().unwrap().put([Record::shape("shape:s1", 0.0, 0.0)]);
    let mut sessions = [&mut a, &mut b];
    let leaked = pump_until(&mut sessions, || store_b.lock().unwrap().contains("shape:s1"));
    assert!(timeout(Duration::from_millis(300), leaked).await.is_err());
    assert!(!store_b.lock().unwrap().contains("shape:s1"));
    assert_eq!(server.stats().await.total_frames, 1);
}

#[tokio::test]
async fn test_peer_behind_small_buffer_still_converges() {
    let (server, url) = start_relay(RelayConfig {
        broadcast_capacity: 1,
        ..RelayConfig::default()
    })
    .await;
    let a = Connection::connect(&format!("{url}/board")).await.unwrap();
    let (store_b, mut b) = join(&format!("{url}/board"), 2).await;
    wait_for_peers(&server, "board", 2).await;

    // A burst well beyond the buffer; whatever B's forwarder misses must
    // come back through a full-state resync.
    const SHAPES: u64 = 64;
    for i in 0..SHAPES {
        let record = Record::shape(format!("shape:{i}"), i as f64, 0.0);
        a.send(update_frame(100 + i, &record)).unwrap();
    }

    let arrived = pump_until(&mut [&mut b], || {
        let store = store_b.lock().unwrap();
        (0..SHAPES).all(|i| store.contains(&format!("shape:{i}")))
    })
    .await;
    assert!(arrived, "B should hold every shape of the burst");
    assert_eq!(b.doc().len(), SHAPES as usize);

    let stats = server.stats().await;
    assert_eq!(stats.malformed_frames, 0);
    if stats.lagged_frames > 0 {
        assert!(stats.resyncs > 0);
    }
}

#[tokio::test]
async fn test_default_room_for_root_path() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let _conn = Connection::connect(&url).await.unwrap();
    wait_for_peers(&server, easel_collab::server::DEFAULT_ROOM, 1).await;
}

#[tokio::test]
async fn test_empty_room_is_removed() {
    let (server, url) = start_relay(RelayConfig::default()).await;
    let conn = Connection::connect(&format!("{url}/board")).await.unwrap();
    wait_for_peers(&server, "board", 1).await;
    assert_eq!(server.room_count().await, 1);

    drop(conn);
    timeout(Duration::from_secs(5), async {
        while server.room_count().await > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("room should be removed once empty");
    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.active_rooms, 0);
}

#[tokio::test]
async fn test_full_room_rejects_peer() {
    let (server, url) = start_relay(RelayConfig {
        max_peers_per_room: 1,
        ..RelayConfig::default()
    })
    .await;
    let _first = Connection::connect(&format!("{url}/board")).await.unwrap();
    wait_for_peers(&server, "board", 1).await;

    let mut second = Connection::connect(&format!("{url}/board")).await.unwrap();
    let closed = timeout(Duration::from_secs(5), second.recv()).await.unwrap();
    assert_eq!(closed, None);
    assert_eq!(server.stats().await.rejected_connections, 1);
    assert_eq!(server.room_peers("board").await, 1);
}
