//! Conflict resolution strategies.
//!
//! Six interchangeable strategies decide which side of a conflict survives,
//! or build a merged operation that preserves both intents:
//!
//! | Strategy    | Behavior                                                |
//! |-------------|---------------------------------------------------------|
//! | `Timestamp` | Strictly later wins; ties break on the smaller id       |
//! | `Priority`  | Higher per-user priority wins; equal falls to timestamp |
//! | `Merge`     | Type-specific combination; unmergeable falls to manual  |
//! | `Manual`    | Parked in a queue until a human supplies the outcome    |
//! | `Voting`    | Majority per operation id; tie → timestamp, none → manual |
//! | `Expert`    | Explicit expert decision; absent → manual               |
//!
//! A strategy error never aborts the caller: it is caught and recorded as a
//! `Failed` resolution with the message preserved in metadata. The history
//! of every resolution is kept append-only for auditing.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use atelier_core::operation::{META_PRIORITY, PARAM_REFERENCES};
use atelier_core::{Operation, OperationKind, Quaternion};

use crate::conflict::{Conflict, ConflictKind};
use crate::transform::later_wins;

/// Separator used when two string property values are concatenated.
/// Lossy, but both inputs stay visible for human review.
const STRING_MERGE_SEPARATOR: &str = " | ";

/// Which resolution strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    Timestamp,
    Priority,
    Merge,
    Manual,
    Voting,
    Expert,
}

/// Final state of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    Success,
    Pending,
    Failed,
}

/// An expert's verdict on a conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExpertChoice {
    First,
    Second,
    Custom(Box<Operation>),
}

/// Strategy-specific input, typed per strategy instead of an untyped map so
/// that a `Voting` call cannot silently miss its votes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum ResolutionContext {
    #[default]
    None,
    /// Per-user priorities for [`ResolutionStrategy::Priority`].
    Priorities(BTreeMap<Uuid, u32>),
    /// Vote tally per operation id for [`ResolutionStrategy::Voting`].
    Votes(BTreeMap<Uuid, u32>),
    /// Expert decision for [`ResolutionStrategy::Expert`].
    Expert { expert_id: Uuid, choice: ExpertChoice },
}

/// The auditable record of one resolution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub id: Uuid,
    pub conflict_id: Uuid,
    pub outcome: ResolutionOutcome,
    pub strategy_used: ResolutionStrategy,
    pub resolved_operation: Option<Operation>,
    pub resolved_by: Option<Uuid>,
    pub resolved_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
}

impl Resolution {
    fn new(conflict_id: Uuid, strategy: ResolutionStrategy, outcome: ResolutionOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            conflict_id,
            outcome,
            strategy_used: strategy,
            resolved_operation: None,
            resolved_by: None,
            resolved_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }
}

/// What a strategy decided before it is recorded.
enum Verdict {
    /// A surviving (possibly merged) operation.
    Resolved(Operation, Option<Uuid>),
    /// Escalate to the manual queue.
    Manual,
}

/// Runs strategies, owns the manual queue and the append-only history.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    manual_queue: VecDeque<Conflict>,
    history: Vec<Resolution>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve one conflict with the given strategy.
    ///
    /// Never panics and never propagates a strategy error: failures become
    /// `Failed` resolutions so that one poisoned conflict cannot stall the
    /// rest of a reconnect batch.
    pub fn resolve(
        &mut self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        context: &ResolutionContext,
    ) -> Resolution {
        let verdict = match strategy {
            ResolutionStrategy::Timestamp => self.by_timestamp(conflict),
            ResolutionStrategy::Priority => self.by_priority(conflict, context),
            ResolutionStrategy::Merge => self.by_merge(conflict),
            ResolutionStrategy::Manual => Ok(Verdict::Manual),
            ResolutionStrategy::Voting => self.by_voting(conflict, context),
            ResolutionStrategy::Expert => self.by_expert(conflict, context),
        };

        let resolution = match verdict {
            Ok(Verdict::Resolved(operation, resolved_by)) => {
                let mut r = Resolution::new(conflict.id, strategy, ResolutionOutcome::Success);
                r.metadata.insert(
                    "winner".into(),
                    Value::String(operation.id.to_string()),
                );
                r.resolved_operation = Some(operation);
                r.resolved_by = resolved_by;
                r
            }
            Ok(Verdict::Manual) => {
                self.manual_queue.push_back(conflict.clone());
                log::info!(
                    "conflict {} ({:?}) queued for manual resolution (ops {} / {})",
                    conflict.id,
                    conflict.kind,
                    conflict.op1.id,
                    conflict.op2.id
                );
                Resolution::new(conflict.id, strategy, ResolutionOutcome::Pending)
            }
            Err(message) => {
                log::warn!(
                    "strategy {strategy:?} failed for conflict {}: {message}",
                    conflict.id
                );
                let mut r = Resolution::new(conflict.id, strategy, ResolutionOutcome::Failed);
                r.metadata.insert("error".into(), Value::String(message));
                r
            }
        };

        self.history.push(resolution.clone());
        resolution
    }

    /// Complete a previously queued conflict with a human-supplied
    /// operation. Returns `None` when the conflict is not in the queue.
    pub fn resolve_manual(
        &mut self,
        conflict_id: Uuid,
        final_operation: Operation,
        resolved_by: Uuid,
    ) -> Option<Resolution> {
        let position = self.manual_queue.iter().position(|c| c.id == conflict_id)?;
        self.manual_queue.remove(position);

        let mut resolution =
            Resolution::new(conflict_id, ResolutionStrategy::Manual, ResolutionOutcome::Success);
        resolution.resolved_operation = Some(final_operation);
        resolution.resolved_by = Some(resolved_by);
        self.history.push(resolution.clone());
        Some(resolution)
    }

    /// Conflicts awaiting a human decision.
    pub fn manual_queue(&self) -> &VecDeque<Conflict> {
        &self.manual_queue
    }

    /// Append-only audit trail of every resolution attempt.
    pub fn history(&self) -> &[Resolution] {
        &self.history
    }

    // ── strategies ───────────────────────────────────────────────

    fn by_timestamp(&self, conflict: &Conflict) -> Result<Verdict, String> {
        let winner = if later_wins(&conflict.op1, &conflict.op2) {
            &conflict.op1
        } else {
            &conflict.op2
        };
        Ok(Verdict::Resolved(winner.clone(), None))
    }

    fn by_priority(
        &self,
        conflict: &Conflict,
        context: &ResolutionContext,
    ) -> Result<Verdict, String> {
        let priorities = match context {
            ResolutionContext::Priorities(p) => Some(p),
            _ => None,
        };
        let p1 = user_priority(&conflict.op1, priorities);
        let p2 = user_priority(&conflict.op2, priorities);

        if p1 == p2 {
            return self.by_timestamp(conflict);
        }
        let winner = if p1 > p2 { &conflict.op1 } else { &conflict.op2 };
        Ok(Verdict::Resolved(winner.clone(), None))
    }

    fn by_voting(
        &self,
        conflict: &Conflict,
        context: &ResolutionContext,
    ) -> Result<Verdict, String> {
        let votes = match context {
            ResolutionContext::Votes(v) => v,
            _ => return Ok(Verdict::Manual),
        };
        let v1 = votes.get(&conflict.op1.id).copied().unwrap_or(0);
        let v2 = votes.get(&conflict.op2.id).copied().unwrap_or(0);

        if v1 == 0 && v2 == 0 {
            return Ok(Verdict::Manual);
        }
        if v1 == v2 {
            return self.by_timestamp(conflict);
        }
        let winner = if v1 > v2 { &conflict.op1 } else { &conflict.op2 };
        Ok(Verdict::Resolved(winner.clone(), None))
    }

    fn by_expert(
        &self,
        conflict: &Conflict,
        context: &ResolutionContext,
    ) -> Result<Verdict, String> {
        let (expert_id, choice) = match context {
            ResolutionContext::Expert { expert_id, choice } => (*expert_id, choice),
            _ => return Ok(Verdict::Manual),
        };

        let operation = match choice {
            ExpertChoice::First => conflict.op1.clone(),
            ExpertChoice::Second => conflict.op2.clone(),
            ExpertChoice::Custom(op) => {
                if op.object_id != conflict.op1.object_id
                    && !conflict.affected_objects.contains(&op.object_id)
                {
                    return Err(format!(
                        "expert operation targets object {} outside the conflict",
                        op.object_id
                    ));
                }
                (**op).clone()
            }
        };
        Ok(Verdict::Resolved(operation, Some(expert_id)))
    }

    fn by_merge(&self, conflict: &Conflict) -> Result<Verdict, String> {
        let merged = match conflict.kind {
            ConflictKind::Property => merge_property(&conflict.op1, &conflict.op2),
            ConflictKind::Position => merge_position(&conflict.op1, &conflict.op2),
            ConflictKind::Constraint => merge_constraint(&conflict.op1, &conflict.op2),
            // Deletions and engine-injected kinds have no safe automatic
            // combination.
            _ => None,
        };
        Ok(match merged {
            Some(op) => Verdict::Resolved(op, None),
            None => Verdict::Manual,
        })
    }
}

fn user_priority(op: &Operation, priorities: Option<&BTreeMap<Uuid, u32>>) -> u32 {
    if let Some(p) = priorities.and_then(|p| p.get(&op.user_id)) {
        return *p;
    }
    op.metadata
        .get(META_PRIORITY)
        .and_then(Value::as_u64)
        .map(|p| p as u32)
        .unwrap_or(0)
}

/// Skeleton for a merge product: later side's identity fields win, lineage
/// recorded, ready for the merged parameters.
fn merge_base(op1: &Operation, op2: &Operation, kind: OperationKind) -> Operation {
    let later = if later_wins(op1, op2) { op1 } else { op2 };
    Operation::new(kind, op1.object_id, later.user_id)
        .with_timestamp(later.timestamp)
        .with_version(op1.version.max(op2.version))
        .with_merged_from(&[op1.id, op2.id])
}

// ── merge semantics ──────────────────────────────────────────────

/// Fold two property edits into one `Modify`.
///
/// Disjoint keys are unioned. Overlapping numeric values average (exactly,
/// in decimal, when either side is decimal-typed); overlapping strings
/// concatenate. Any other overlap is unmergeable.
fn merge_property(op1: &Operation, op2: &Operation) -> Option<Operation> {
    let mut merged = merge_base(op1, op2, OperationKind::Modify);

    // Earlier writer first, later writer overlaid.
    let (earlier, later) = if later_wins(op1, op2) { (op2, op1) } else { (op1, op2) };
    for (key, value) in &earlier.parameters {
        merged.parameters.insert(key.clone(), value.clone());
    }
    for (key, value) in &later.parameters {
        merged.parameters.insert(key.clone(), value.clone());
    }

    // Overlapping end-state keys need a real combination.
    let keys2 = op2.effective_keys();
    for key in op1.effective_keys() {
        if !keys2.contains(&key) {
            continue;
        }
        let combined = merge_values(op1.param(key)?, op2.param(key)?)?;
        merged.parameters.insert(key.to_string(), combined);
    }

    Some(merged)
}

/// Combine two values written concurrently to the same property key.
fn merge_values(v1: &Value, v2: &Value) -> Option<Value> {
    if let (Some(d1), Some(d2)) = (as_decimal(v1), as_decimal(v2)) {
        let mean = (d1 + d2) / Decimal::TWO;
        // Either side decimal-typed (a decimal string) keeps the exact
        // representation; plain JSON numbers stay numbers.
        if v1.is_string() || v2.is_string() {
            return Some(Value::String(mean.normalize().to_string()));
        }
        return number_value(mean);
    }

    if let (Value::String(s1), Value::String(s2)) = (v1, v2) {
        return Some(Value::String(format!("{s1}{STRING_MERGE_SEPARATOR}{s2}")));
    }

    None
}

/// Numeric view of a JSON value: numbers directly, strings only when they
/// parse as decimals (that is what "decimal-typed" means on this wire).
fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn number_value(d: Decimal) -> Option<Value> {
    use rust_decimal::prelude::ToPrimitive;
    if d.fract().is_zero() {
        return d.to_i64().map(Value::from);
    }
    d.to_f64().and_then(serde_json::Number::from_f64).map(Value::Number)
}

/// Combine two contended placements.
///
/// Two `Move`s meet at the midpoint. Two `Rotate`s compose through
/// quaternions — never an Euler average, which is rotation-order dependent
/// and falls apart near gimbal lock. Everything else is unmergeable.
fn merge_position(op1: &Operation, op2: &Operation) -> Option<Operation> {
    use OperationKind::{Move, Rotate};
    match (op1.kind, op2.kind) {
        (Move, Move) => {
            let p1 = op1.point_param("position")?;
            let p2 = op2.point_param("position")?;
            Some(merge_base(op1, op2, Move).with_point_param("position", p1.midpoint(&p2)))
        }
        (Rotate, Rotate) => {
            let q1 = Quaternion::from_euler(&op1.euler_param("rotation")?);
            let q2 = Quaternion::from_euler(&op2.euler_param("rotation")?);
            // Apply op1's rotation, then op2's.
            let composed = Quaternion::compose(&q1, &q2).normalize().to_euler();
            Some(merge_base(op1, op2, Rotate).with_euler_param("rotation", composed))
        }
        _ => None,
    }
}

/// Only a fixed whitelist of constraint types can coexist as a compound
/// constraint; anything else needs a human.
fn merge_constraint(op1: &Operation, op2: &Operation) -> Option<Operation> {
    const COMPATIBLE: [(&str, &str); 3] = [
        ("distance", "angle"),
        ("parallel", "perpendicular"),
        ("horizontal", "vertical"),
    ];

    let t1 = op1.constraint_type()?;
    let t2 = op2.constraint_type()?;
    let compatible = COMPATIBLE
        .iter()
        .any(|(a, b)| (t1 == *a && t2 == *b) || (t1 == *b && t2 == *a));
    if !compatible {
        return None;
    }

    let mut references: Vec<Value> = Vec::new();
    for id in op1.referenced_objects().into_iter().chain(op2.referenced_objects()) {
        let v = Value::String(id.to_string());
        if !references.contains(&v) {
            references.push(v);
        }
    }

    Some(
        merge_base(op1, op2, OperationKind::ConstraintAdd)
            .with_param("constraint_type", "compound")
            .with_param(
                "sub_constraints",
                Value::Array(vec![Value::String(t1.into()), Value::String(t2.into())]),
            )
            .with_param(PARAM_REFERENCES, Value::Array(references)),
    )
}
