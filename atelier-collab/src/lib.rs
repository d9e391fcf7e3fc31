//! # atelier-collab — real-time collaboration core for Atelier
//!
//! The concurrency heart of the platform: lets several users mutate the
//! same CAD model at once, reconciles conflicting edits, tracks who is
//! looking at or holding what, and lets disconnected clients rejoin
//! without losing work.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  Operation   ┌──────────────────────────────┐
//! │ Client A │ ───────────► │ DocumentSession (authority)  │
//! └──────────┘              │   ├─ OperationBuffer         │
//! ┌──────────┐   offline    │   ├─ PresenceManager         │
//! │ Client B │ ──┐          │   ├─ LockManager             │
//! └──────────┘   │reconnect │   └─ SyncCoordinator         │
//!                └────────► │        ├─ TransformEngine    │
//!                           │        └─ ConflictResolver   │
//!                           └──────┬───────────┬───────────┘
//!                                  ▼           ▼
//!                           BroadcastSink   CacheMirror (advisory)
//! ```
//!
//! ## Modules
//!
//! - [`transform`] — pairwise operational transform (best-effort, not CRDT)
//! - [`conflict`] / [`resolve`] — detection and six resolution strategies
//! - [`presence`] — cursors, viewports, selections, activity states
//! - [`lock`] — shared/exclusive object locks with FIFO wait queues
//! - [`buffer`] — bounded per-document history with guarded compaction
//! - [`sync`] — offline buffering, reconnection, version-vector checksums
//! - [`session`] — the per-document owner of all of the above
//! - [`protocol`] / [`broadcast`] — outward-facing events and their fan-out
//! - [`cache`] — distributed-cache read projection (never the authority)

pub mod broadcast;
pub mod buffer;
pub mod cache;
pub mod conflict;
pub mod error;
pub mod lock;
pub mod presence;
pub mod protocol;
pub mod resolve;
pub mod session;
pub mod sync;
pub mod transform;

// Re-exports for convenience
pub use broadcast::{BroadcastSink, BroadcastStats, ChannelBroadcaster, RecordingSink};
pub use buffer::{CompactionReport, OperationBuffer, PushOutcome, SkipReason, SkippedGroup};
pub use cache::{CacheMirror, DistributedCache, InMemoryCache, LOCK_TTL, PRESENCE_TTL};
pub use conflict::{Conflict, ConflictDetector, ConflictKind, Severity};
pub use error::CollabError;
pub use lock::{LockEvent, LockGrant, LockKind, LockManager, ObjectLock};
pub use presence::{
    stable_color, CursorState, PresenceConfig, PresenceEvent, PresenceManager, PresenceStatus,
    UserPresence, Viewport,
};
pub use protocol::{CollabMessage, MessageType};
pub use resolve::{
    ConflictResolver, ExpertChoice, Resolution, ResolutionContext, ResolutionOutcome,
    ResolutionStrategy,
};
pub use session::{
    DocumentSession, GeometryPort, NullGeometry, SessionConfig, SessionManager, SubmitOutcome,
};
pub use sync::{compute_checksum, SyncCoordinator, SyncReport, SyncState};
pub use transform::{TransformEngine, TransformOutcome};
