//! Fan-out of relay frames to the other peers of a room.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a peer that falls further behind loses the oldest ones.
//! Frames are tagged with the sending connection so the forwarder can skip
//! echoing them back.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// A frame plus the connection it came from. `Uuid::nil()` marks frames
/// originated by the relay itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: Uuid,
    pub bytes: Vec<u8>,
}

/// Counters for one group.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    /// Frames handed to the channel, whether or not anyone received them
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// One room's fan-out channel and membership.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create an empty group. Each receiver buffers at most `capacity`
    /// frames; tokio rejects a capacity of zero.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a connection and return its receiver. The receiver only
    /// sees frames broadcast after this call.
    pub async fn add_peer(&self, conn_id: Uuid) -> broadcast::Receiver<Arc<Envelope>> {
        self.peers.write().await.insert(conn_id);
        self.sender.subscribe()
    }

    /// Forget a connection. Returns `false` if it was not registered.
    /// Its receiver stays valid until dropped.
    pub async fn remove_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.write().await.remove(conn_id)
    }

    /// Send a frame to every subscriber. Filtering out the sender is the
    /// receiving side's job. Returns the number of receivers reached.
    pub fn broadcast(&self, from: Uuid, bytes: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Envelope { from, bytes }))
            .unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Registered connections.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether `conn_id` is currently registered.
    pub async fn has_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.contains(conn_id)
    }

    /// Current send counter and membership size.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    /// Per-receiver buffer size the group was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_peer() {
        let group = BroadcastGroup::new(16);
        let peer = Uuid::new_v4();

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer).await);

        assert!(group.remove_peer(&peer).await);
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.remove_peer(&peer).await);
    }

    #[tokio::test]
    async fn test_fan_out_carries_sender() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut rx_alice = group.add_peer(alice).await;
        let mut rx_bob = group.add_peer(bob).await;

        assert_eq!(group.broadcast(alice, vec![0, 1, 2]), 2);

        let at_bob = rx_bob.recv().await.unwrap();
        assert_eq!(at_bob.from, alice);
        assert_eq!(at_bob.bytes, vec![0, 1, 2]);
        // The sender's own receiver also sees it; the forwarder skips it.
        assert_eq!(rx_alice.recv().await.unwrap().from, alice);
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(Uuid::nil(), vec![1]), 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(Uuid::new_v4()).await;
        for i in 0..5u8 {
            group.broadcast(Uuid::nil(), vec![i]);
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().bytes, vec![3]);
    }

    #[tokio::test]
    async fn test_capacity() {
        assert_eq!(BroadcastGroup::new(32).capacity(), 32);
    }
}
