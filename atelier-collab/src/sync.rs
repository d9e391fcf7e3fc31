//! Offline sync coordination.
//!
//! One coordinator per document tracks every client's [`SyncState`] and
//! reconciles offline edits on reconnect:
//!
//! ```text
//! handle_reconnection(user, offline_ops, client_checksum)
//!        │
//!        ├─ checksum mismatch ──► full resync (server truth, pending cleared)
//!        │
//!        ├─ fetch server ops since last_sync_version (buffer order)
//!        ├─ pairwise-transform each offline op against each fetched op
//!        │      unresolved ──► detect ──► resolve (default: Merge)
//!        ├─ apply surviving non-no-ops (buffer + version vector)
//!        └─ new version = old + fetched + applied; checksum recomputed
//! ```
//!
//! The checksum is a SHA-256 over the document's version vector with sorted
//! keys and locale-free formatting, so identical logical state hashes
//! identically in any process and any insertion order. Reconnection either
//! fully commits or leaves the client's `SyncState` untouched.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use atelier_core::Operation;

use crate::buffer::OperationBuffer;
use crate::conflict::ConflictDetector;
use crate::error::CollabError;
use crate::resolve::{ConflictResolver, ResolutionContext, ResolutionOutcome, ResolutionStrategy};
use crate::transform::TransformEngine;

/// Per-client, per-document synchronization state.
///
/// Exactly one of `offline_since` / `online_since` is set at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub user_id: Uuid,
    pub document_id: Uuid,
    pub last_sync_version: u64,
    pub last_sync_timestamp: DateTime<Utc>,
    pub offline_since: Option<DateTime<Utc>>,
    pub online_since: Option<DateTime<Utc>>,
    /// Server-side staging for operations queued while the client is away.
    pub pending_operations: Vec<Operation>,
    pub checksum: String,
}

impl SyncState {
    fn new(user_id: Uuid, document_id: Uuid, version: u64, checksum: String) -> Self {
        Self {
            user_id,
            document_id,
            last_sync_version: version,
            last_sync_timestamp: Utc::now(),
            offline_since: None,
            online_since: Some(Utc::now()),
            pending_operations: Vec::new(),
            checksum,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online_since.is_some()
    }
}

/// What one reconnection did.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub full_resync: bool,
    /// Server operations the client had missed.
    pub fetched: usize,
    /// Operations (transformed offline ops and merge products) applied.
    pub applied: Vec<Operation>,
    pub conflicts_resolved: usize,
    /// Offline operations dropped because resolution failed or went manual.
    pub rejected: usize,
    pub new_version: u64,
    pub checksum: String,
}

/// Reconciles offline clients against the document's accepted history.
pub struct SyncCoordinator {
    document_id: Uuid,
    clients: HashMap<Uuid, SyncState>,
    /// Per-client accepted-operation counters — the version vector the
    /// checksum is computed over.
    version_vector: BTreeMap<Uuid, u64>,
    engine: TransformEngine,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    default_strategy: ResolutionStrategy,
}

impl SyncCoordinator {
    pub fn new(document_id: Uuid) -> Self {
        Self {
            document_id,
            clients: HashMap::new(),
            version_vector: BTreeMap::new(),
            engine: TransformEngine::new(),
            detector: ConflictDetector::new(),
            resolver: ConflictResolver::new(),
            default_strategy: ResolutionStrategy::Merge,
        }
    }

    pub fn with_strategy(document_id: Uuid, strategy: ResolutionStrategy) -> Self {
        let mut coordinator = Self::new(document_id);
        coordinator.default_strategy = strategy;
        coordinator
    }

    /// Register a client at the document's current version. Idempotent.
    pub fn register_client(&mut self, user_id: Uuid, current_version: u64) -> &SyncState {
        let checksum = self.checksum();
        self.clients
            .entry(user_id)
            .or_insert_with(|| SyncState::new(user_id, self.document_id, current_version, checksum))
    }

    pub fn mark_offline(&mut self, user_id: Uuid) -> Result<(), CollabError> {
        let state = self.clients.get_mut(&user_id).ok_or(CollabError::UnknownClient(user_id))?;
        if state.offline_since.is_none() {
            state.offline_since = Some(Utc::now());
            state.online_since = None;
        }
        Ok(())
    }

    pub fn mark_online(&mut self, user_id: Uuid) -> Result<(), CollabError> {
        let state = self.clients.get_mut(&user_id).ok_or(CollabError::UnknownClient(user_id))?;
        if state.online_since.is_none() {
            state.online_since = Some(Utc::now());
            state.offline_since = None;
        }
        Ok(())
    }

    /// Stage an operation for a disconnected client. No-ops are filtered
    /// here, before they ever reach a queue; returns whether it was kept.
    pub fn queue_offline(&mut self, user_id: Uuid, operation: Operation) -> Result<bool, CollabError> {
        let state = self.clients.get_mut(&user_id).ok_or(CollabError::UnknownClient(user_id))?;
        if operation.is_no_op() {
            return Ok(false);
        }
        if state.pending_operations.iter().any(|op| op.id == operation.id) {
            return Ok(false);
        }
        state.pending_operations.push(operation);
        Ok(true)
    }

    /// Record that an operation by `user_id` was accepted while online, so
    /// the version vector (and therefore the checksum) stays truthful.
    pub fn note_applied(&mut self, user_id: Uuid) {
        *self.version_vector.entry(user_id).or_insert(0) += 1;
    }

    /// Current server checksum over the version vector.
    pub fn checksum(&self) -> String {
        compute_checksum(&self.version_vector)
    }

    pub fn version_vector(&self) -> &BTreeMap<Uuid, u64> {
        &self.version_vector
    }

    pub fn client(&self, user_id: &Uuid) -> Option<&SyncState> {
        self.clients.get(user_id)
    }

    /// Conflicts parked for a human decision during reconciliation.
    pub fn manual_queue(&self) -> &std::collections::VecDeque<crate::conflict::Conflict> {
        self.resolver.manual_queue()
    }

    /// Resolution audit trail.
    pub fn resolution_history(&self) -> &[crate::resolve::Resolution] {
        self.resolver.history()
    }

    /// Complete a manually queued conflict with a human-supplied operation.
    pub fn resolve_manual(
        &mut self,
        conflict_id: Uuid,
        final_operation: Operation,
        resolved_by: Uuid,
    ) -> Option<crate::resolve::Resolution> {
        self.resolver.resolve_manual(conflict_id, final_operation, resolved_by)
    }

    /// Reconcile a reconnecting client. See the module docs for the flow.
    ///
    /// The client's `SyncState` is only written once the whole pass has
    /// succeeded; a failure leaves it exactly as it was.
    pub fn handle_reconnection(
        &mut self,
        user_id: Uuid,
        offline_ops: Vec<Operation>,
        client_checksum: &str,
        buffer: &mut OperationBuffer,
    ) -> Result<SyncReport, CollabError> {
        let state = self
            .clients
            .get(&user_id)
            .cloned()
            .ok_or(CollabError::UnknownClient(user_id))?;

        // Divergent client: the transform path cannot be trusted, so the
        // server state wins wholesale.
        if client_checksum != state.checksum {
            log::info!(
                "document {}: client {user_id} checksum mismatch, full resync",
                self.document_id
            );
            let new_version = buffer.latest_version();
            let checksum = self.checksum();
            let committed = self.clients.get_mut(&user_id).expect("checked above");
            committed.last_sync_version = new_version;
            committed.last_sync_timestamp = Utc::now();
            committed.pending_operations.clear();
            committed.checksum = checksum.clone();
            committed.online_since = Some(Utc::now());
            committed.offline_since = None;
            return Ok(SyncReport {
                full_resync: true,
                new_version,
                checksum,
                ..SyncReport::default()
            });
        }

        let server_ops = buffer.ops_since(state.last_sync_version);
        let mut replay: Vec<Operation> = state.pending_operations.clone();
        for op in offline_ops {
            if !replay.iter().any(|existing| existing.id == op.id) {
                replay.push(op);
            }
        }

        let (applied, conflicts_resolved, rejected) =
            self.reconcile(replay, &server_ops, buffer, user_id);

        let new_version = state.last_sync_version + server_ops.len() as u64 + applied.len() as u64;
        let checksum = self.checksum();

        let committed = self.clients.get_mut(&user_id).expect("checked above");
        committed.last_sync_version = new_version;
        committed.last_sync_timestamp = Utc::now();
        committed.pending_operations.clear();
        committed.checksum = checksum.clone();
        committed.online_since = Some(Utc::now());
        committed.offline_since = None;

        Ok(SyncReport {
            full_resync: false,
            fetched: server_ops.len(),
            applied,
            conflicts_resolved,
            rejected,
            new_version,
            checksum,
        })
    }

    /// Partial catch-up over an explicit `[from_version, to_version]`
    /// window. The client stays in its current online/offline state; use
    /// this to resume an interrupted large sync.
    pub fn handle_partial_sync(
        &mut self,
        user_id: Uuid,
        offline_ops: Vec<Operation>,
        from_version: u64,
        to_version: u64,
        buffer: &mut OperationBuffer,
    ) -> Result<SyncReport, CollabError> {
        if !self.clients.contains_key(&user_id) {
            return Err(CollabError::UnknownClient(user_id));
        }

        let server_ops = buffer.ops_in_range(from_version, to_version);
        let (applied, conflicts_resolved, rejected) =
            self.reconcile(offline_ops, &server_ops, buffer, user_id);

        let checksum = self.checksum();
        let committed = self.clients.get_mut(&user_id).expect("checked above");
        committed.last_sync_version = committed.last_sync_version.max(to_version);
        committed.checksum = checksum.clone();
        let new_version = committed.last_sync_version;

        Ok(SyncReport {
            full_resync: false,
            fetched: server_ops.len(),
            applied,
            conflicts_resolved,
            rejected,
            new_version,
            checksum,
        })
    }

    /// Transform each offline operation against the fetched server ops in
    /// order, escalating unresolved pairs to the resolver, and apply the
    /// survivors.
    fn reconcile(
        &mut self,
        offline_ops: Vec<Operation>,
        server_ops: &[Operation],
        buffer: &mut OperationBuffer,
        user_id: Uuid,
    ) -> (Vec<Operation>, usize, usize) {
        let mut applied = Vec::new();
        let mut conflicts_resolved = 0;
        let mut rejected = 0;

        'ops: for op in offline_ops {
            let mut current = op;
            for server_op in server_ops {
                let outcome = self.engine.transform(&current, server_op, self.default_strategy);
                if outcome.conflict_resolved {
                    current = outcome.operation;
                    continue;
                }

                let Some(conflict) = self.detector.detect(&current, server_op) else {
                    // The engine refused but the detector sees no
                    // incompatibility; keep the operation as-is.
                    continue;
                };
                let resolution =
                    self.resolver.resolve(&conflict, self.default_strategy, &ResolutionContext::None);
                match (resolution.outcome, resolution.resolved_operation) {
                    (ResolutionOutcome::Success, Some(resolved)) => {
                        conflicts_resolved += 1;
                        current = resolved;
                    }
                    _ => {
                        log::warn!(
                            "document {}: offline op {} rejected against server op {} ({:?})",
                            self.document_id,
                            current.id,
                            server_op.id,
                            self.default_strategy
                        );
                        rejected += 1;
                        continue 'ops;
                    }
                }
            }

            if current.is_no_op() {
                continue;
            }
            current.version = buffer.next_version();
            buffer.push(current.clone());
            *self.version_vector.entry(user_id).or_insert(0) += 1;
            applied.push(current);
        }

        (applied, conflicts_resolved, rejected)
    }
}

/// Deterministic hash over a version vector.
///
/// `BTreeMap` iteration is already key-sorted; the formatting is fixed
/// (`uuid:count;`), so repeated computation over identical logical state
/// yields identical strings regardless of insertion order or process.
pub fn compute_checksum(version_vector: &BTreeMap<Uuid, u64>) -> String {
    let mut hasher = Sha256::new();
    for (client, count) in version_vector {
        hasher.update(client.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(count.to_string().as_bytes());
        hasher.update(b";");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
