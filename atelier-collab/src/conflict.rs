//! Conflict detection and classification.
//!
//! Two operations conflict when they cannot both apply as-is. Detection is
//! purely structural — it looks at kinds, targets and parameter key sets,
//! never at geometry. Classification drives severity and which merge rules
//! the resolver may attempt:
//!
//! | Pairing (same object)                  | Kind       | Severity |
//! |----------------------------------------|------------|----------|
//! | Delete × anything                      | Deletion   | High     |
//! | Modify × Modify, intersecting keys     | Property   | Medium   |
//! | Move/Rotate/Scale × Move/Rotate/Scale  | Position   | Low      |
//! | Constraint × Constraint, shared refs   | Constraint | Medium   |
//!
//! `Hierarchy` and `Semantic` exist in the taxonomy for detectors that run
//! inside the geometry engine; this module never emits them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use atelier_core::Operation;

/// What class of incompatibility was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    Property,
    Position,
    Deletion,
    Constraint,
    Hierarchy,
    Semantic,
}

/// How disruptive the conflict is if left unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A detected incompatibility between two concurrent operations.
///
/// Created by the detector; consumed by a successful resolution or parked
/// in the manual queue when automatic resolution fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub kind: ConflictKind,
    pub op1: Operation,
    pub op2: Operation,
    pub detected_at: DateTime<Utc>,
    pub affected_objects: Vec<Uuid>,
    pub severity: Severity,
}

impl Conflict {
    fn new(kind: ConflictKind, op1: &Operation, op2: &Operation, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            op1: op1.clone(),
            op2: op2.clone(),
            detected_at: Utc::now(),
            affected_objects: vec![op1.object_id],
            severity,
        }
    }

    fn with_affected(mut self, objects: Vec<Uuid>) -> Self {
        self.affected_objects = objects;
        self
    }
}

/// Structural conflict detector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Classify a pair of concurrent operations, or `None` when both can
    /// apply as-is.
    pub fn detect(&self, op1: &Operation, op2: &Operation) -> Option<Conflict> {
        // No-ops never conflict with anything.
        if op1.is_no_op() || op2.is_no_op() {
            return None;
        }

        // Constraint pairs can conflict across objects through shared
        // references; everything else requires the same target.
        if op1.kind.is_constraint() && op2.kind.is_constraint() {
            return self.detect_constraint(op1, op2);
        }

        if op1.object_id != op2.object_id {
            return None;
        }

        use atelier_core::OperationKind::Delete;
        if op1.kind == Delete || op2.kind == Delete {
            return Some(Conflict::new(ConflictKind::Deletion, op1, op2, Severity::High));
        }

        if op1.kind.is_property_edit() && op2.kind.is_property_edit() {
            let keys1 = op1.effective_keys();
            let overlapping = op2.effective_keys().iter().any(|k| keys1.contains(k));
            if overlapping {
                return Some(Conflict::new(ConflictKind::Property, op1, op2, Severity::Medium));
            }
            return None;
        }

        if op1.kind.is_positional() && op2.kind.is_positional() {
            return Some(Conflict::new(ConflictKind::Position, op1, op2, Severity::Low));
        }

        None
    }

    fn detect_constraint(&self, op1: &Operation, op2: &Operation) -> Option<Conflict> {
        let refs1 = op1.referenced_objects();
        let refs2 = op2.referenced_objects();
        let shared = refs1.iter().any(|id| refs2.contains(id));
        if !shared {
            return None;
        }

        let mut union = refs1;
        for id in refs2 {
            if !union.contains(&id) {
                union.push(id);
            }
        }

        Some(
            Conflict::new(ConflictKind::Constraint, op1, op2, Severity::Medium)
                .with_affected(union),
        )
    }
}
