//! Per-document operation buffer.
//!
//! Holds the document's recent accepted history in version order, with an
//! id index so that at-least-once delivery dedups cheaply. The buffer is
//! capacity-bounded: when full it first compacts, and only if that frees
//! nothing does it evict the oldest entry — loudly, never silently.
//!
//! Compaction guards (per object-id group):
//! - single author only, and
//! - no `Delete` mixed with any other kind.
//!
//! Groups failing either guard stay untouched and are reported for review.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atelier_core::{Operation, OperationKind};

/// Result of inserting one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Inserted,
    /// Same id already accepted — duplicate delivery, nothing to do.
    Duplicate,
    /// Inserted, but capacity forced the oldest entry out.
    InsertedEvicting(Uuid),
}

/// Why a group was left uncompacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    MultipleAuthors,
    MixedDelete,
}

/// A group compaction refused to touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedGroup {
    pub object_id: Uuid,
    pub reason: SkipReason,
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default)]
pub struct CompactionReport {
    /// Operations removed by pairwise merging.
    pub merged_away: usize,
    pub skipped: Vec<SkippedGroup>,
}

/// Version-ordered, capacity-bounded operation history.
pub struct OperationBuffer {
    capacity: usize,
    order: VecDeque<Uuid>,
    by_id: HashMap<Uuid, Operation>,
    /// Monotonic version counter; versions are never reused.
    next_version: u64,
}

impl OperationBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity.min(1024)),
            by_id: HashMap::new(),
            next_version: 0,
        }
    }

    /// Claim the next version number in the document's total order.
    pub fn next_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Highest version handed out so far.
    pub fn latest_version(&self) -> u64 {
        self.next_version
    }

    /// Insert an accepted operation. Duplicate ids are idempotent.
    pub fn push(&mut self, operation: Operation) -> PushOutcome {
        if self.by_id.contains_key(&operation.id) {
            return PushOutcome::Duplicate;
        }

        let mut evicted = None;
        if self.order.len() >= self.capacity {
            let report = self.compact();
            if report.merged_away > 0 {
                log::debug!(
                    "buffer full: compaction merged away {} operations",
                    report.merged_away
                );
            }
            if self.order.len() >= self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.by_id.remove(&oldest);
                    log::warn!("buffer full: evicted oldest operation {oldest}");
                    evicted = Some(oldest);
                }
            }
        }

        self.order.push_back(operation.id);
        self.by_id.insert(operation.id, operation);
        match evicted {
            Some(id) => PushOutcome::InsertedEvicting(id),
            None => PushOutcome::Inserted,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&Operation> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All operations in buffer order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Operations with `version > after`, in version order. This is the
    /// fetch a reconnecting client replays against.
    pub fn ops_since(&self, after: u64) -> Vec<Operation> {
        let mut ops: Vec<Operation> =
            self.iter().filter(|op| op.version > after).cloned().collect();
        ops.sort_by_key(|op| op.version);
        ops
    }

    /// Operations with `from < version <= to`, for partial catch-ups.
    pub fn ops_in_range(&self, from: u64, to: u64) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .iter()
            .filter(|op| op.version > from && op.version <= to)
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.version);
        ops
    }

    /// Merge runs of same-kind operations per object.
    ///
    /// Only `Modify`+`Modify` and `Move`+`Move` pairs combine, in timestamp
    /// order, the later operation's kind/user/timestamp/version winning and
    /// parameter maps unioned with the later key winning overlaps. The
    /// merged operation is new and records both parents in `merged_from`.
    pub fn compact(&mut self) -> CompactionReport {
        let mut report = CompactionReport::default();

        // Group ids by object, preserving first-seen order of groups.
        let mut groups: Vec<(Uuid, Vec<Uuid>)> = Vec::new();
        for id in &self.order {
            let Some(op) = self.by_id.get(id) else { continue };
            match groups.iter_mut().find(|(obj, _)| *obj == op.object_id) {
                Some((_, ids)) => ids.push(*id),
                None => groups.push((op.object_id, vec![*id])),
            }
        }

        let mut compacted: Vec<Operation> = Vec::with_capacity(self.order.len());
        for (object_id, ids) in groups {
            let mut ops: Vec<Operation> =
                ids.iter().filter_map(|id| self.by_id.get(id)).cloned().collect();
            if ops.len() < 2 {
                compacted.extend(ops);
                continue;
            }

            let single_author = ops.iter().all(|op| op.user_id == ops[0].user_id);
            let has_delete = ops.iter().any(|op| op.kind == OperationKind::Delete);
            if !single_author {
                report.skipped.push(SkippedGroup { object_id, reason: SkipReason::MultipleAuthors });
                compacted.extend(ops);
                continue;
            }
            if has_delete && ops.iter().any(|op| op.kind != OperationKind::Delete) {
                report.skipped.push(SkippedGroup { object_id, reason: SkipReason::MixedDelete });
                compacted.extend(ops);
                continue;
            }

            ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
            let mut folded: Vec<Operation> = Vec::with_capacity(ops.len());
            for op in ops {
                let merges = folded.last().is_some_and(|prev| mergeable_pair(prev, &op));
                if merges {
                    let prev = folded.pop().expect("non-empty");
                    folded.push(merge_pair(&prev, &op));
                    report.merged_away += 1;
                } else {
                    folded.push(op);
                }
            }
            compacted.extend(folded);
        }

        // Rebuild in version order so the total order survives compaction.
        compacted.sort_by_key(|op| op.version);
        self.order.clear();
        self.by_id.clear();
        for op in compacted {
            self.order.push_back(op.id);
            self.by_id.insert(op.id, op);
        }
        report
    }
}

fn mergeable_pair(a: &Operation, b: &Operation) -> bool {
    a.kind == b.kind && matches!(a.kind, OperationKind::Modify | OperationKind::Move)
}

/// `later` wins kind/user/timestamp/version; parameters union with later
/// keys winning overlaps.
fn merge_pair(earlier: &Operation, later: &Operation) -> Operation {
    let mut merged = Operation::new(later.kind, later.object_id, later.user_id)
        .with_timestamp(later.timestamp)
        .with_version(later.version)
        .with_merged_from(&[earlier.id, later.id]);
    for (key, value) in &earlier.parameters {
        merged.parameters.insert(key.clone(), value.clone());
    }
    for (key, value) in &later.parameters {
        merged.parameters.insert(key.clone(), value.clone());
    }
    merged
}
