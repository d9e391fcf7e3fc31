//! Binary protocol for outward-facing collaboration events.
//!
//! Wire format (bincode-encoded envelope):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ user_id   │ document_id  │ version  │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes     │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! The envelope and the fixed-shape payloads (cursor, selection, lock,
//! join) are bincode. Operation payloads are JSON inside the envelope:
//! operation parameters are open `serde_json` values, which a positional
//! binary format cannot round-trip.
//!
//! This module defines the events and payloads only — delivery belongs to
//! whatever transport implements the broadcast sink.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atelier_core::{Operation, Point3D};

use crate::error::CollabError;
use crate::lock::LockKind;
use crate::presence::{PresenceStatus, Viewport};

/// Message types for the collaboration protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// An accepted operation, fanned out to the other clients
    Operation = 1,
    /// Cursor position update (rate-limited upstream)
    CursorMoved = 2,
    /// Viewport (camera) change
    ViewportChanged = 3,
    /// Selection set replaced
    SelectionChanged = 4,
    /// Lock granted to a user
    LockGranted = 5,
    /// Lock released or expired
    LockReleased = 6,
    /// User joined the document
    UserJoined = 7,
    /// User left the document
    UserLeft = 8,
    /// Presence status change (active/idle/away)
    StatusChanged = 9,
    /// Heartbeat ping
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// Cursor payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPayload {
    pub position: Point3D,
}

/// Selection payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionPayload {
    pub selected: Vec<Uuid>,
}

/// Lock grant/release payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockPayload {
    pub object_id: Uuid,
    pub holder: Uuid,
    pub kind: LockKind,
}

/// Join payload with display metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub name: String,
    pub color: [f32; 4],
}

/// Status payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: PresenceStatus,
}

/// Viewport payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportPayload {
    pub viewport: Viewport,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabMessage {
    pub msg_type: MessageType,
    pub user_id: Uuid,
    pub document_id: Uuid,
    /// Document version at emission time (0 for presence traffic).
    pub version: u64,
    pub payload: Vec<u8>,
}

impl CollabMessage {
    fn envelope(msg_type: MessageType, user_id: Uuid, document_id: Uuid, version: u64, payload: Vec<u8>) -> Self {
        Self { msg_type, user_id, document_id, version, payload }
    }

    /// An accepted operation. Payload is JSON (open parameter values).
    pub fn operation(document_id: Uuid, version: u64, op: &Operation) -> Result<Self, CollabError> {
        let payload =
            serde_json::to_vec(op).map_err(|e| CollabError::Serialization(e.to_string()))?;
        Ok(Self::envelope(MessageType::Operation, op.user_id, document_id, version, payload))
    }

    pub fn cursor_moved(user_id: Uuid, document_id: Uuid, position: Point3D) -> Self {
        let payload = encode_payload(&CursorPayload { position });
        Self::envelope(MessageType::CursorMoved, user_id, document_id, 0, payload)
    }

    pub fn viewport_changed(user_id: Uuid, document_id: Uuid, viewport: Viewport) -> Self {
        let payload = encode_payload(&ViewportPayload { viewport });
        Self::envelope(MessageType::ViewportChanged, user_id, document_id, 0, payload)
    }

    pub fn selection_changed(user_id: Uuid, document_id: Uuid, selected: Vec<Uuid>) -> Self {
        let payload = encode_payload(&SelectionPayload { selected });
        Self::envelope(MessageType::SelectionChanged, user_id, document_id, 0, payload)
    }

    pub fn lock_granted(document_id: Uuid, object_id: Uuid, holder: Uuid, kind: LockKind) -> Self {
        let payload = encode_payload(&LockPayload { object_id, holder, kind });
        Self::envelope(MessageType::LockGranted, holder, document_id, 0, payload)
    }

    pub fn lock_released(document_id: Uuid, object_id: Uuid, holder: Uuid, kind: LockKind) -> Self {
        let payload = encode_payload(&LockPayload { object_id, holder, kind });
        Self::envelope(MessageType::LockReleased, holder, document_id, 0, payload)
    }

    pub fn user_joined(user_id: Uuid, document_id: Uuid, name: impl Into<String>, color: [f32; 4]) -> Self {
        let payload = encode_payload(&JoinPayload { name: name.into(), color });
        Self::envelope(MessageType::UserJoined, user_id, document_id, 0, payload)
    }

    pub fn user_left(user_id: Uuid, document_id: Uuid) -> Self {
        Self::envelope(MessageType::UserLeft, user_id, document_id, 0, Vec::new())
    }

    pub fn status_changed(user_id: Uuid, document_id: Uuid, status: PresenceStatus) -> Self {
        let payload = encode_payload(&StatusPayload { status });
        Self::envelope(MessageType::StatusChanged, user_id, document_id, 0, payload)
    }

    pub fn ping(user_id: Uuid) -> Self {
        Self::envelope(MessageType::Ping, user_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(user_id: Uuid) -> Self {
        Self::envelope(MessageType::Pong, user_id, Uuid::nil(), 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an operation payload.
    pub fn operation_payload(&self) -> Result<Operation, CollabError> {
        if self.msg_type != MessageType::Operation {
            return Err(CollabError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| CollabError::Deserialization(e.to_string()))
    }

    pub fn cursor_payload(&self) -> Result<CursorPayload, CollabError> {
        self.typed_payload(MessageType::CursorMoved)
    }

    pub fn selection_payload(&self) -> Result<SelectionPayload, CollabError> {
        self.typed_payload(MessageType::SelectionChanged)
    }

    pub fn lock_payload(&self) -> Result<LockPayload, CollabError> {
        if self.msg_type != MessageType::LockGranted && self.msg_type != MessageType::LockReleased {
            return Err(CollabError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    pub fn join_payload(&self) -> Result<JoinPayload, CollabError> {
        self.typed_payload(MessageType::UserJoined)
    }

    pub fn status_payload(&self) -> Result<StatusPayload, CollabError> {
        self.typed_payload(MessageType::StatusChanged)
    }

    pub fn viewport_payload(&self) -> Result<ViewportPayload, CollabError> {
        self.typed_payload(MessageType::ViewportChanged)
    }

    fn typed_payload<T: serde::de::DeserializeOwned>(
        &self,
        expected: MessageType,
    ) -> Result<T, CollabError> {
        if self.msg_type != expected {
            return Err(CollabError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CollabError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CollabError::Deserialization(e.to_string()))?;
    Ok(value)
}
