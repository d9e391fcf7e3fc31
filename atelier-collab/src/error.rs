//! Error taxonomy for the collaboration core.
//!
//! Contention and checksum mismatches are deliberately NOT errors: lock
//! contention returns a queued grant, and a checksum mismatch triggers a
//! full resync. Only genuinely exceptional situations surface here.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the collaboration core.
#[derive(Debug, Clone, Error)]
pub enum CollabError {
    /// A conflict referenced an operation that is not in the buffer.
    /// Fail fast; not retried.
    #[error("conflict {conflict_id} references missing operation {operation_id}")]
    MissingOperand {
        conflict_id: Uuid,
        operation_id: Uuid,
    },

    /// Wire or cache encoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Wire or cache decoding failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A payload was read as the wrong message type.
    #[error("invalid message type")]
    InvalidMessageType,

    /// The geometry engine refused an applied operation.
    #[error("geometry engine rejected operation {operation_id}: {reason}")]
    GeometryRejected {
        operation_id: Uuid,
        reason: String,
    },

    /// The client has never been registered with the sync coordinator.
    #[error("unknown client {0}")]
    UnknownClient(Uuid),

    /// The advisory cache mirror could not be written. Never fatal to the
    /// document; callers log and continue.
    #[error("distributed cache unavailable: {0}")]
    CacheUnavailable(String),
}
