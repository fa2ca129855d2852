//! Binary wire protocol multiplexing document updates and presence.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ type tag │ payload                      │
//! │ 1 byte   │ variable (opaque to the core)│
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! Tag 0 carries an incremental CRDT update, tag 1 a presence delta.
//! The payload belongs to the CRDT engine or the presence subsystem and
//! is never inspected here.

use crate::error::{CollabError, CollabResult};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Incremental document update since the sender's last published version
    Update = 0,
    /// Ephemeral per-peer presence change
    Presence = 1,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CollabError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageType::Update),
            1 => Ok(MessageType::Presence),
            other => Err(CollabError::UnknownMessageType(other)),
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Frame a CRDT update.
    pub fn update(payload: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            payload,
        }
    }

    /// Frame a presence delta.
    pub fn presence(payload: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Presence,
            payload,
        }
    }

    /// Serialize to wire bytes: tag followed by payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.payload.len());
        bytes.push(self.msg_type.tag());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse wire bytes. Empty frames and unknown tags are rejected.
    pub fn decode(bytes: &[u8]) -> CollabResult<Self> {
        let (msg_type, payload) = split(bytes)?;
        Ok(Self {
            msg_type,
            payload: payload.to_vec(),
        })
    }
}

/// Borrowing variant of [`WireMessage::decode`].
pub fn split(bytes: &[u8]) -> CollabResult<(MessageType, &[u8])> {
    let (&tag, payload) = bytes.split_first().ok_or(CollabError::EmptyMessage)?;
    Ok((MessageType::try_from(tag)?, payload))
}
