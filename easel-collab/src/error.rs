//! Error types for the collaboration layer.

use thiserror::Error;

pub type CollabResult<T> = Result<T, CollabError>;

/// Errors raised by the sync engine, the transport and the relay.
///
/// None of these are fatal to a session: inbound failures are logged and
/// the offending message is dropped.
#[derive(Debug, Error)]
pub enum CollabError {
    /// Zero-length frame (no type tag).
    #[error("empty message")]
    EmptyMessage,

    /// Frame whose first byte is not a known type tag.
    #[error("unknown message type tag {0}")]
    UnknownMessageType(u8),

    /// CRDT update bytes could not be decoded.
    #[error("failed to decode document update: {0}")]
    UpdateDecode(String),

    /// CRDT update decoded but could not be integrated.
    #[error("failed to apply document update: {0}")]
    UpdateApply(String),

    /// Presence delta could not be encoded or decoded.
    #[error("presence codec error: {0}")]
    Presence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The shared editor store mutex was poisoned by a panicking writer.
    #[error("editor store lock poisoned")]
    StorePoisoned,

    #[error("connection closed")]
    ConnectionClosed,

    /// Outgoing queue is full; the frame was not sent.
    #[error("outgoing queue full")]
    ChannelFull,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for CollabError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CollabError::WebSocket(e.to_string())
    }
}
