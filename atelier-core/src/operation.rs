//! The immutable unit of change.
//!
//! An [`Operation`] is created by a client (or by a merge routine) and never
//! mutated afterwards — transforms and merges always build a new operation
//! and record lineage in `merged_from` metadata. Identity is the `id`, never
//! the content: two operations with equal payloads are still two operations.
//!
//! Parameters are JSON values keyed by well-known names (`position`,
//! `rotation`, `scale`, `references`, …) so that the geometry engine and the
//! merge routines agree on payload shape without a schema per kind.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::math::{EulerAngles, Point3D};

/// Parameter key for the target of a `Move`.
pub const PARAM_POSITION: &str = "position";
/// Parameter key for the target of a `Rotate`.
pub const PARAM_ROTATION: &str = "rotation";
/// Parameter key for the target of a `Scale`.
pub const PARAM_SCALE: &str = "scale";
/// Parameter key holding the objects a constraint references.
pub const PARAM_REFERENCES: &str = "references";
/// Parameter key naming a constraint's type.
pub const PARAM_CONSTRAINT_TYPE: &str = "constraint_type";
/// Prefix marking the pre-change value of a parameter.
pub const PARAM_PREVIOUS_PREFIX: &str = "previous_";
/// Metadata key recording the parent operations of a merge product.
pub const META_MERGED_FROM: &str = "merged_from";
/// Metadata key for a per-user priority hint.
pub const META_PRIORITY: &str = "priority";

/// What an operation does to its target object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Move,
    Rotate,
    Scale,
    Modify,
    Delete,
    PropertyChange,
    ConstraintAdd,
    ConstraintRemove,
}

impl OperationKind {
    /// Move/Rotate/Scale all contend for the object's placement.
    pub fn is_positional(&self) -> bool {
        matches!(self, OperationKind::Move | OperationKind::Rotate | OperationKind::Scale)
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, OperationKind::ConstraintAdd | OperationKind::ConstraintRemove)
    }

    /// Modify and PropertyChange both edit named properties.
    pub fn is_property_edit(&self) -> bool {
        matches!(self, OperationKind::Modify | OperationKind::PropertyChange)
    }
}

/// An immutable change to a single model object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub object_id: Uuid,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Position in the document's total order; assigned on acceptance.
    pub version: u64,
    /// BTreeMap so encoding is deterministic across processes.
    pub parameters: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, Value>,
}

impl Operation {
    pub fn new(kind: OperationKind, object_id: Uuid, user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            object_id,
            user_id,
            timestamp: Utc::now(),
            version: 0,
            parameters: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_point_param(self, key: impl Into<String>, point: Point3D) -> Self {
        // Point3D always serializes; unwrap would still be safe, but stay quiet.
        let value = serde_json::to_value(point).unwrap_or(Value::Null);
        self.with_param(key, value)
    }

    pub fn with_euler_param(self, key: impl Into<String>, angles: EulerAngles) -> Self {
        let value = serde_json::to_value(angles).unwrap_or(Value::Null);
        self.with_param(key, value)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Record the parents this operation was merged from.
    pub fn with_merged_from(mut self, parents: &[Uuid]) -> Self {
        let ids: Vec<Value> = parents.iter().map(|id| Value::String(id.to_string())).collect();
        self.metadata.insert(META_MERGED_FROM.to_string(), Value::Array(ids));
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn point_param(&self, key: &str) -> Option<Point3D> {
        self.parameters
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn euler_param(&self, key: &str) -> Option<EulerAngles> {
        self.parameters
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Objects referenced by a constraint operation (always includes the
    /// target object itself).
    pub fn referenced_objects(&self) -> Vec<Uuid> {
        let mut refs = vec![self.object_id];
        if let Some(Value::Array(items)) = self.parameters.get(PARAM_REFERENCES) {
            for item in items {
                if let Some(id) = item.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    if !refs.contains(&id) {
                        refs.push(id);
                    }
                }
            }
        }
        refs
    }

    pub fn constraint_type(&self) -> Option<&str> {
        self.parameters.get(PARAM_CONSTRAINT_TYPE).and_then(Value::as_str)
    }

    /// Parents recorded by a merge, if any.
    pub fn merged_from(&self) -> Vec<Uuid> {
        match self.metadata.get(META_MERGED_FROM) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Parameter keys that describe an end state (not a `previous_*` echo).
    pub fn effective_keys(&self) -> Vec<&str> {
        self.parameters
            .keys()
            .filter(|k| !k.starts_with(PARAM_PREVIOUS_PREFIX))
            .map(String::as_str)
            .collect()
    }

    /// True when applying this operation cannot change the document.
    ///
    /// Empty parameters are always a no-op. An operation whose every end
    /// state value equals the recorded `previous_*` value is also a no-op
    /// (a `Move` back to the same coordinates, a `Modify` writing the value
    /// already present). `Delete` and constraint edits always have effect.
    pub fn is_no_op(&self) -> bool {
        if self.parameters.is_empty() {
            return true;
        }
        match self.kind {
            OperationKind::Delete | OperationKind::ConstraintAdd | OperationKind::ConstraintRemove => false,
            _ => {
                let effective = self.effective_keys();
                if effective.is_empty() {
                    // Only previous_* echoes: nothing to apply.
                    return true;
                }
                effective.iter().all(|key| {
                    let prev_key = format!("{PARAM_PREVIOUS_PREFIX}{key}");
                    match (self.parameters.get(*key), self.parameters.get(&prev_key)) {
                        (Some(new), Some(prev)) => new == prev,
                        _ => false,
                    }
                })
            }
        }
    }
}

// Identity is the id, never the content.
impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Operation {}

impl Hash for Operation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
