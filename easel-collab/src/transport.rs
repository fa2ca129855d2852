//! Message-oriented byte channel between a session and the network.
//!
//! ```text
//!            Connection                         WebSocket
//!  send() ──► outgoing mpsc ──► writer task ──► Message::Binary ──►
//!  recv() ◄── incoming mpsc ◄── reader task ◄── Message::Binary ◄──
//! ```
//!
//! Sends never wait: a full or closed queue is reported to the caller,
//! which logs and moves on. The incoming side closes when the socket does.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{CollabError, CollabResult};

/// Frames buffered in each direction.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub struct Connection {
    outgoing: mpsc::Sender<Vec<u8>>,
    incoming: mpsc::Receiver<Vec<u8>>,
}

impl Connection {
    pub fn new(outgoing: mpsc::Sender<Vec<u8>>, incoming: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { outgoing, incoming }
    }

    /// Two in-memory endpoints wired to each other.
    pub fn pair(capacity: usize) -> (Connection, Connection) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (Connection::new(a_tx, a_rx), Connection::new(b_tx, b_rx))
    }

    /// Open a WebSocket connection to `url` (e.g. `ws://127.0.0.1:9090/room`).
    pub async fn connect(url: &str) -> CollabResult<Connection> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("connected to {url}");

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(DEFAULT_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(DEFAULT_CHANNEL_CAPACITY);

        // Writer task: outgoing channel → WebSocket.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                    log::error!("websocket send failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: WebSocket → incoming channel.
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::error!("websocket receive failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            log::debug!("websocket reader finished");
        });

        Ok(Connection::new(out_tx, in_rx))
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: Vec<u8>) -> CollabResult<()> {
        self.outgoing.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => CollabError::ChannelFull,
            TrySendError::Closed(_) => CollabError::ConnectionClosed,
        })
    }

    /// Next inbound frame, or `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    /// Next already-arrived frame. `Ok(None)` if nothing is waiting,
    /// `Err(ConnectionClosed)` once the peer is gone and the queue is empty.
    pub fn try_recv(&mut self) -> CollabResult<Option<Vec<u8>>> {
        match self.incoming.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CollabError::ConnectionClosed),
        }
    }

    /// True once the outgoing side can no longer deliver.
    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut a, mut b) = Connection::pair(8);
        a.send(vec![0, 1]).unwrap();
        b.send(vec![1, 2]).unwrap();

        assert_eq!(b.recv().await, Some(vec![0, 1]));
        assert_eq!(a.recv().await, Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_try_recv_empty_then_frame() {
        let (a, mut b) = Connection::pair(8);
        assert!(matches!(b.try_recv(), Ok(None)));
        a.send(vec![7]).unwrap();
        assert_eq!(b.try_recv().unwrap(), Some(vec![7]));
    }

    #[tokio::test]
    async fn test_full_queue_is_reported() {
        let (a, _b) = Connection::pair(1);
        a.send(vec![1]).unwrap();
        assert!(matches!(a.send(vec![2]), Err(CollabError::ChannelFull)));
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_both_directions() {
        let (mut a, b) = Connection::pair(8);
        drop(b);
        assert!(a.is_closed());
        assert!(matches!(a.send(vec![1]), Err(CollabError::ConnectionClosed)));
        assert!(matches!(a.try_recv(), Err(CollabError::ConnectionClosed)));
        assert_eq!(a.recv().await, None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is never a websocket server in the test environment.
        assert!(Connection::connect("ws://127.0.0.1:1/room").await.is_err());
    }
}
