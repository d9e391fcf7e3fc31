//! Pairwise operational transform.
//!
//! Given two operations generated concurrently against the same base
//! version, rebase one so it can replay after the other. This is a
//! best-effort heuristic transform, not a provably convergent OT system:
//! applying `a'` after `b` approximates, but does not guarantee, the result
//! of applying `b'` after `a`. Whenever no reasonable transform exists the
//! outcome reports `conflict_resolved = false` and the caller escalates to
//! the conflict resolver.
//!
//! The transformed operation keeps its id — it is the same logical edit,
//! rebased — so duplicate delivery still dedups in the buffer.

use atelier_core::{Operation, OperationKind};

use crate::resolve::ResolutionStrategy;

/// Result of rebasing `op_a` over `op_b`.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    /// The rebased operation (may have degenerated to a no-op).
    pub operation: Operation,
    /// False means the pair must go through conflict resolution.
    pub conflict_resolved: bool,
}

impl TransformOutcome {
    fn resolved(operation: Operation) -> Self {
        Self { operation, conflict_resolved: true }
    }

    fn unresolved(operation: Operation) -> Self {
        Self { operation, conflict_resolved: false }
    }
}

/// The pairwise transform engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformEngine;

impl TransformEngine {
    pub fn new() -> Self {
        Self
    }

    /// Rebase `op_a` to apply after `op_b` has already been applied.
    ///
    /// `strategy` lets the engine short-circuit simple overlaps inline:
    /// under [`ResolutionStrategy::Timestamp`] a last-writer-wins decision
    /// is cheap and deterministic, so overlapping property writes and
    /// contended placements are settled here instead of escalating. Every
    /// other strategy needs the resolver's machinery, so those pairs come
    /// back unresolved.
    pub fn transform(
        &self,
        op_a: &Operation,
        op_b: &Operation,
        strategy: ResolutionStrategy,
    ) -> TransformOutcome {
        // A no-op on either side cannot interfere.
        if op_a.is_no_op() || op_b.is_no_op() {
            return TransformOutcome::resolved(op_a.clone());
        }

        // Constraint pairs interact through shared references even across
        // different target objects.
        if op_a.kind.is_constraint() && op_b.kind.is_constraint() {
            return self.transform_constraint(op_a, op_b);
        }

        if op_a.object_id != op_b.object_id {
            return TransformOutcome::resolved(op_a.clone());
        }

        use OperationKind::Delete;
        match (op_a.kind, op_b.kind) {
            // Duplicate delete: the second one has nothing left to do.
            (Delete, Delete) => TransformOutcome::resolved(degenerate(op_a)),
            // The target is gone; a cannot be rebased onto nothing.
            (_, Delete) => TransformOutcome::unresolved(op_a.clone()),
            // Deleting after any mutation is still a valid delete.
            (Delete, _) => TransformOutcome::resolved(op_a.clone()),

            (a, b) if a.is_property_edit() && b.is_property_edit() => {
                self.transform_property(op_a, op_b, strategy)
            }

            (a, b) if a.is_positional() && b.is_positional() => {
                self.transform_positional(op_a, op_b, strategy)
            }

            // Orthogonal aspects (placement vs. properties, constraint vs.
            // mutation): both can apply.
            _ => TransformOutcome::resolved(op_a.clone()),
        }
    }

    fn transform_property(
        &self,
        op_a: &Operation,
        op_b: &Operation,
        strategy: ResolutionStrategy,
    ) -> TransformOutcome {
        let keys_b = op_b.effective_keys();
        let overlapping: Vec<String> = op_a
            .effective_keys()
            .iter()
            .filter(|k| keys_b.contains(k))
            .map(|k| k.to_string())
            .collect();

        if overlapping.is_empty() {
            return TransformOutcome::resolved(op_a.clone());
        }

        if strategy == ResolutionStrategy::Timestamp {
            if later_wins(op_a, op_b) {
                return TransformOutcome::resolved(op_a.clone());
            }
            // b already wrote the overlapping keys and wins; keep only a's
            // non-contended writes.
            let mut rebased = op_a.clone();
            for key in &overlapping {
                rebased.parameters.remove(key);
                rebased.parameters.remove(&format!("previous_{key}"));
            }
            return TransformOutcome::resolved(rebased);
        }

        TransformOutcome::unresolved(op_a.clone())
    }

    fn transform_positional(
        &self,
        op_a: &Operation,
        op_b: &Operation,
        strategy: ResolutionStrategy,
    ) -> TransformOutcome {
        // Mixed kinds (Move vs. Rotate vs. Scale) touch independent
        // components of the placement; both apply cleanly.
        if op_a.kind != op_b.kind {
            return TransformOutcome::resolved(op_a.clone());
        }

        // Identical targets: replaying a after b changes nothing, but it is
        // safe and keeps intent.
        let target_key = match op_a.kind {
            OperationKind::Move => "position",
            OperationKind::Rotate => "rotation",
            _ => "scale",
        };
        if let (Some(ta), Some(tb)) = (op_a.param(target_key), op_b.param(target_key)) {
            if ta == tb {
                return TransformOutcome::resolved(op_a.clone());
            }
        }

        if strategy == ResolutionStrategy::Timestamp {
            if later_wins(op_a, op_b) {
                return TransformOutcome::resolved(op_a.clone());
            }
            return TransformOutcome::resolved(degenerate(op_a));
        }

        TransformOutcome::unresolved(op_a.clone())
    }

    fn transform_constraint(&self, op_a: &Operation, op_b: &Operation) -> TransformOutcome {
        let refs_b = op_b.referenced_objects();
        let shared = op_a.referenced_objects().iter().any(|id| refs_b.contains(id));
        if shared {
            TransformOutcome::unresolved(op_a.clone())
        } else {
            TransformOutcome::resolved(op_a.clone())
        }
    }
}

/// Last-writer-wins with the deterministic tie-break: strictly later
/// timestamp wins; on an exact tie the smaller operation id wins, so every
/// replica reaches the same verdict.
pub(crate) fn later_wins(op_a: &Operation, op_b: &Operation) -> bool {
    if op_a.timestamp != op_b.timestamp {
        op_a.timestamp > op_b.timestamp
    } else {
        op_a.id < op_b.id
    }
}

/// Strip an operation down to a no-op while preserving its identity.
fn degenerate(op: &Operation) -> Operation {
    let mut stripped = op.clone();
    stripped.parameters.clear();
    stripped
}
