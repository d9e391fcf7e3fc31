//! Per-document authority.
//!
//! One [`DocumentSession`] owns everything mutable about a document —
//! presence, locks, buffer, sync states — and is the only place any of it
//! changes. Multi-instance deployments shard sessions by document id; the
//! distributed cache only ever carries a projection of what the session
//! decided.
//!
//! ```text
//! Client op ──► DocumentSession::submit_operation()
//!                    │ no-op filter · id dedup · geometry apply
//!                    ▼
//!               OperationBuffer (version order) ──► BroadcastSink
//!
//! SessionManager ── doc_id ──► Arc<Mutex<DocumentSession>>
//!        │
//!        └── background sweeps: idle ~10 s · lock expiry ~5 s · mirror ~2 s
//! ```
//!
//! Sessions sit behind a tokio `Mutex`: per-connection tasks serialize
//! their mutations through it, and the sweeps take it only long enough to
//! run one sweep body.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use atelier_core::{Operation, Point3D};

use crate::broadcast::{BroadcastSink, ChannelBroadcaster};
use crate::buffer::{OperationBuffer, PushOutcome};
use crate::cache::{CacheMirror, DistributedCache};
use crate::error::CollabError;
use crate::lock::{LockEvent, LockGrant, LockKind, LockManager};
use crate::presence::{PresenceConfig, PresenceEvent, PresenceManager, Viewport};
use crate::protocol::CollabMessage;
use crate::resolve::ResolutionStrategy;
use crate::sync::{SyncCoordinator, SyncReport, SyncState};

/// Receives every accepted operation. Implemented by the geometry
/// execution engine; the core does not retry failures.
pub trait GeometryPort: Send {
    fn apply(&mut self, operation: &Operation) -> Result<(), CollabError>;
}

/// Geometry port that accepts everything. The default for sessions whose
/// geometry engine lives elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGeometry;

impl GeometryPort for NullGeometry {
    fn apply(&mut self, _operation: &Operation) -> Result<(), CollabError> {
        Ok(())
    }
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub buffer_capacity: usize,
    pub presence: PresenceConfig,
    /// TTL for shared locks taken automatically by selection.
    pub selection_lock_ttl: chrono::Duration,
    pub broadcast_capacity: usize,
    pub default_strategy: ResolutionStrategy,
    pub idle_sweep_interval: Duration,
    pub lock_sweep_interval: Duration,
    pub mirror_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            presence: PresenceConfig::default(),
            selection_lock_ttl: chrono::Duration::seconds(300),
            broadcast_capacity: 256,
            default_strategy: ResolutionStrategy::Merge,
            idle_sweep_interval: Duration::from_secs(10),
            lock_sweep_interval: Duration::from_secs(5),
            mirror_interval: Duration::from_secs(2),
        }
    }
}

/// What submitting an operation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted at this document version.
    Applied { version: u64 },
    /// Filtered before queueing: applying it could not change anything.
    FilteredNoOp,
    /// Already accepted earlier (at-least-once delivery).
    Duplicate,
}

/// All mutable state of one document, behind one owner.
pub struct DocumentSession {
    document_id: Uuid,
    config: SessionConfig,
    presence: PresenceManager,
    locks: LockManager,
    buffer: OperationBuffer,
    sync: SyncCoordinator,
    geometry: Box<dyn GeometryPort + Send>,
    sink: Arc<dyn BroadcastSink>,
}

impl DocumentSession {
    pub fn new(
        document_id: Uuid,
        config: SessionConfig,
        geometry: Box<dyn GeometryPort + Send>,
        sink: Arc<dyn BroadcastSink>,
    ) -> Self {
        Self {
            document_id,
            presence: PresenceManager::with_config(config.presence),
            locks: LockManager::new(),
            buffer: OperationBuffer::new(config.buffer_capacity),
            sync: SyncCoordinator::with_strategy(document_id, config.default_strategy),
            geometry,
            sink,
            config,
        }
    }

    /// Default wiring: no geometry engine, in-process broadcast channel.
    pub fn with_defaults(document_id: Uuid) -> Self {
        Self::new(
            document_id,
            SessionConfig::default(),
            Box::new(NullGeometry),
            Arc::new(ChannelBroadcaster::new(SessionConfig::default().broadcast_capacity)),
        )
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    // ── operations ───────────────────────────────────────────────

    /// Accept one operation from an online client.
    ///
    /// No-ops are filtered before queueing; duplicate ids dedup against the
    /// buffer. The geometry engine sees the operation before any in-memory
    /// state changes, so a typed geometry failure leaves the session
    /// untouched.
    pub fn submit_operation(&mut self, operation: Operation) -> Result<SubmitOutcome, CollabError> {
        if operation.is_no_op() {
            return Ok(SubmitOutcome::FilteredNoOp);
        }
        if self.buffer.contains(&operation.id) {
            return Ok(SubmitOutcome::Duplicate);
        }

        self.geometry.apply(&operation)?;

        let versioned = operation.with_version(self.buffer.next_version());
        let version = versioned.version;
        let author = versioned.user_id;

        if let PushOutcome::InsertedEvicting(evicted) = self.buffer.push(versioned.clone()) {
            log::warn!(
                "document {}: history overflow evicted operation {evicted}",
                self.document_id
            );
        }
        self.sync.note_applied(author);
        if let Some(event) = self.presence.touch(author) {
            self.publish_presence(event);
        }

        match CollabMessage::operation(self.document_id, version, &versioned) {
            Ok(message) => self.publish(&message),
            Err(e) => log::error!("operation broadcast encode failed: {e}"),
        }
        Ok(SubmitOutcome::Applied { version })
    }

    // ── presence ─────────────────────────────────────────────────

    pub fn join_user(&mut self, user_id: Uuid, name: impl Into<String>) -> &SyncState {
        let event = self.presence.join(user_id, name);
        self.publish_presence(event);
        self.sync.register_client(user_id, self.buffer.latest_version())
    }

    /// Remove a user: locks released, presence dropped, client marked
    /// offline so a later reconnect can pick up where it left off.
    pub fn leave_user(&mut self, user_id: Uuid) {
        let lock_events = self.locks.release_all(user_id);
        self.publish_lock_events(&lock_events);
        if self.presence.remove(user_id).is_some() {
            self.publish(&CollabMessage::user_left(user_id, self.document_id));
        }
        let _ = self.sync.mark_offline(user_id);
    }

    pub fn update_cursor(&mut self, user_id: Uuid, position: Point3D) {
        if let Some(event) = self.presence.update_cursor(user_id, position) {
            self.publish_presence(event);
        }
    }

    pub fn update_viewport(&mut self, user_id: Uuid, viewport: Viewport) {
        if let Some(event) = self.presence.update_viewport(user_id, viewport) {
            self.publish_presence(event);
        }
    }

    /// Replace a user's selection, taking a shared lock on each object.
    /// Objects exclusively locked by someone else are silently excluded.
    /// Returns the selection that actually took effect.
    pub fn select_objects(&mut self, user_id: Uuid, objects: Vec<Uuid>) -> Vec<Uuid> {
        let mut granted = Vec::with_capacity(objects.len());
        for object_id in objects {
            if !self.locks.selectable(object_id, user_id) {
                continue;
            }
            let grant = self.locks.acquire(
                object_id,
                user_id,
                LockKind::Shared,
                Some(self.config.selection_lock_ttl),
            );
            if grant.is_granted() {
                self.presence.note_lock_granted(user_id, object_id);
                granted.push(object_id);
            }
        }
        if let Some(event) = self.presence.set_selection(user_id, granted.clone()) {
            self.publish_presence(event);
        }
        granted
    }

    // ── locks ────────────────────────────────────────────────────

    pub fn acquire_lock(
        &mut self,
        object_id: Uuid,
        user_id: Uuid,
        kind: LockKind,
        ttl: Option<chrono::Duration>,
    ) -> LockGrant {
        let grant = self.locks.acquire(object_id, user_id, kind, ttl);
        if grant.is_granted() {
            self.presence.note_lock_granted(user_id, object_id);
            self.publish(&CollabMessage::lock_granted(self.document_id, object_id, user_id, kind));
        }
        grant
    }

    pub fn release_lock(&mut self, object_id: Uuid, user_id: Uuid) {
        let events = self.locks.release(object_id, user_id);
        self.publish_lock_events(&events);
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn buffer(&self) -> &OperationBuffer {
        &self.buffer
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    // ── offline sync ─────────────────────────────────────────────

    pub fn mark_offline(&mut self, user_id: Uuid) -> Result<(), CollabError> {
        self.sync.mark_offline(user_id)
    }

    pub fn queue_offline(&mut self, user_id: Uuid, operation: Operation) -> Result<bool, CollabError> {
        self.sync.queue_offline(user_id, operation)
    }

    /// Reconcile a reconnecting client and fan the applied operations out.
    pub fn reconnect(
        &mut self,
        user_id: Uuid,
        offline_ops: Vec<Operation>,
        client_checksum: &str,
    ) -> Result<SyncReport, CollabError> {
        let report =
            self.sync
                .handle_reconnection(user_id, offline_ops, client_checksum, &mut self.buffer)?;

        for op in &report.applied {
            if let Err(e) = self.geometry.apply(op) {
                log::error!(
                    "document {}: geometry rejected reconciled op {}: {e}",
                    self.document_id,
                    op.id
                );
            }
            match CollabMessage::operation(self.document_id, op.version, op) {
                Ok(message) => self.publish(&message),
                Err(e) => log::error!("operation broadcast encode failed: {e}"),
            }
        }
        if let Some(event) = self.presence.touch(user_id) {
            self.publish_presence(event);
        }
        Ok(report)
    }

    /// Complete a manually queued conflict. The human-chosen operation goes
    /// through the normal submit path so geometry, versioning and broadcast
    /// all see it.
    pub fn resolve_manual(
        &mut self,
        conflict_id: Uuid,
        final_operation: Operation,
        resolved_by: Uuid,
    ) -> Result<Option<SubmitOutcome>, CollabError> {
        let Some(resolution) = self.sync.resolve_manual(conflict_id, final_operation, resolved_by)
        else {
            return Ok(None);
        };
        match resolution.resolved_operation {
            Some(operation) => self.submit_operation(operation).map(Some),
            None => Ok(None),
        }
    }

    /// Resume an interrupted catch-up over an explicit version window.
    pub fn partial_sync(
        &mut self,
        user_id: Uuid,
        offline_ops: Vec<Operation>,
        from_version: u64,
        to_version: u64,
    ) -> Result<SyncReport, CollabError> {
        self.sync
            .handle_partial_sync(user_id, offline_ops, from_version, to_version, &mut self.buffer)
    }

    // ── background sweeps ────────────────────────────────────────

    /// Idle sweep body (run ~10 s).
    pub fn sweep_idle(&mut self) {
        for event in self.presence.check_idle() {
            self.publish_presence(event);
        }
    }

    /// Lock-expiry sweep body (run ~5 s).
    pub fn sweep_locks(&mut self) {
        let events = self.locks.sweep_expired();
        self.publish_lock_events(&events);
    }

    /// Mirror sweep body (run ~2 s). Advisory only; failures are logged
    /// inside the mirror and never surface here.
    pub fn mirror_state<C: DistributedCache>(&self, mirror: &CacheMirror<C>) {
        mirror.mirror_presence(self.document_id, self.presence.users());
        mirror.mirror_locks(self.document_id, &self.locks.snapshot());
    }

    // ── internal ─────────────────────────────────────────────────

    fn publish(&self, message: &CollabMessage) {
        if let Err(e) = self.sink.publish(message) {
            log::warn!("document {}: broadcast failed: {e}", self.document_id);
        }
    }

    fn publish_presence(&self, event: PresenceEvent) {
        let doc = self.document_id;
        let message = match event {
            PresenceEvent::Joined { user_id, name, color } => {
                CollabMessage::user_joined(user_id, doc, name, color)
            }
            PresenceEvent::Left { user_id } => CollabMessage::user_left(user_id, doc),
            PresenceEvent::CursorMoved { user_id, position } => {
                CollabMessage::cursor_moved(user_id, doc, position)
            }
            PresenceEvent::ViewportChanged { user_id, viewport } => {
                CollabMessage::viewport_changed(user_id, doc, viewport)
            }
            PresenceEvent::SelectionChanged { user_id, selected } => {
                CollabMessage::selection_changed(user_id, doc, selected)
            }
            PresenceEvent::StatusChanged { user_id, status } => {
                CollabMessage::status_changed(user_id, doc, status)
            }
        };
        self.publish(&message);
    }

    fn publish_lock_events(&mut self, events: &[LockEvent]) {
        for event in events {
            match *event {
                LockEvent::Granted { object_id, user_id, kind } => {
                    self.presence.note_lock_granted(user_id, object_id);
                    self.publish(&CollabMessage::lock_granted(
                        self.document_id,
                        object_id,
                        user_id,
                        kind,
                    ));
                }
                LockEvent::Released { object_id, user_id, kind }
                | LockEvent::Expired { object_id, user_id, kind } => {
                    self.presence.note_lock_released(user_id, object_id);
                    self.publish(&CollabMessage::lock_released(
                        self.document_id,
                        object_id,
                        user_id,
                        kind,
                    ));
                }
            }
        }
    }
}

/// Maps document ids to their session authorities.
///
/// Cross-document operations share nothing: each session has its own lock,
/// and the manager's map is only held long enough to hand out handles.
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Mutex<DocumentSession>>>>>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Get or create the session for a document.
    pub async fn get_or_create(&self, document_id: Uuid) -> Arc<Mutex<DocumentSession>> {
        // Fast path: read lock.
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&document_id) {
                return session.clone();
            }
        }

        // Slow path: write lock to create.
        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock.
        if let Some(session) = sessions.get(&document_id) {
            return session.clone();
        }

        let session = Arc::new(Mutex::new(DocumentSession::new(
            document_id,
            self.config.clone(),
            Box::new(NullGeometry),
            Arc::new(ChannelBroadcaster::new(self.config.broadcast_capacity)),
        )));
        sessions.insert(document_id, session.clone());
        log::info!("session created for document {document_id}");
        session
    }

    /// Drop a session once nobody is present in it.
    pub async fn remove_if_empty(&self, document_id: &Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(document_id) {
            if session.lock().await.presence().user_count() == 0 {
                sessions.remove(document_id);
                return true;
            }
        }
        false
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Spawn the periodic sweeps: idle check, lock expiry, cache mirror.
    ///
    /// Each tick locks one session at a time, briefly; a slow sweep body
    /// can delay the next tick but never a foreground request for another
    /// document.
    pub fn spawn_sweeps<C: DistributedCache + 'static>(
        &self,
        mirror: Arc<CacheMirror<C>>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let sessions = self.sessions.clone();
        let interval = self.config.idle_sweep_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let handles: Vec<_> = sessions.read().await.values().cloned().collect();
                for session in handles {
                    session.lock().await.sweep_idle();
                }
            }
        }));

        let sessions = self.sessions.clone();
        let interval = self.config.lock_sweep_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let handles: Vec<_> = sessions.read().await.values().cloned().collect();
                for session in handles {
                    session.lock().await.sweep_locks();
                }
            }
        }));

        let sessions = self.sessions.clone();
        let interval = self.config.mirror_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let handles: Vec<_> = sessions.read().await.values().cloned().collect();
                for session in handles {
                    session.lock().await.mirror_state(mirror.as_ref());
                }
            }
        }));

        handles
    }
}
