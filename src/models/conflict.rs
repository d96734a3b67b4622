//! Conflict model.
//!
//! A [`DetectedConflict`] is data, not an error: concurrent edits are an
//! expected steady state in multi-user planning, and every conflict carries
//! enough of both sides (`current_value`, `conflicting_value`) to be resolved
//! without losing either.
//!
//! # Lifecycle
//! `Detected → Resolving → Resolved`, or `Resolving → Detected` when a
//! resolution attempt fails. No other transitions are allowed.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{EntityType, SchedulingResult};

/// Identifier of a conflict: `CONFLICT-` followed by 32 lowercase hex digits.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConflictId(String);

impl ConflictId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        let bits: u128 = rand::rng().random();
        Self(format!("CONFLICT-{bits:032x}"))
    }

    /// Parses and validates an id.
    pub fn try_new(value: impl Into<String>) -> Result<Self, ConflictIdError> {
        let value = value.into();
        validate_conflict_id(&value)?;
        Ok(Self(value.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ConflictId {
    type Error = ConflictIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<ConflictId> for String {
    fn from(id: ConflictId) -> Self {
        id.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConflictIdError {
    #[error("conflict id must not be empty")]
    Empty,
    #[error("conflict id must match CONFLICT-[0-9a-f]{{32}}")]
    InvalidFormat,
}

fn validate_conflict_id(value: &str) -> Result<(), ConflictIdError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConflictIdError::Empty);
    }
    let Some(hex) = trimmed.strip_prefix("CONFLICT-") else {
        return Err(ConflictIdError::InvalidFormat);
    };
    if hex.len() != 32 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(ConflictIdError::InvalidFormat);
    }
    Ok(())
}

/// Classification of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// A write's base version is behind the stored version.
    OptimisticLocking,
    /// Task state contradicts its dependencies (e.g. started before its predecessor).
    SchedulingConflict,
    /// One assignee is booked on overlapping tasks.
    ResourceOverallocation,
    CircularDependency,
    /// Dates are impossible or fall outside working time.
    DateConstraintViolation,
    /// Current dates break a dependency link.
    DependencyMismatch,
    /// Dangling references, out-of-range values, deleted entities.
    DataIntegrity,
}

/// How urgently a conflict needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle state of a conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    #[default]
    Detected,
    Resolving,
    Resolved,
}

impl ConflictStatus {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ConflictStatus) -> bool {
        matches!(
            (self, next),
            (Self::Detected, Self::Resolving)
                | (Self::Resolving, Self::Resolved)
                | (Self::Resolving, Self::Detected)
        )
    }
}

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Keep the stored state, discard the incoming edit.
    Current,
    /// Accept the incoming edit.
    Incoming,
    /// Use caller-supplied field values.
    Manual,
    /// Combine both sides field by field using merge rules.
    Merge,
}

/// A conflict found by detection or integrity checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedConflict {
    pub id: ConflictId,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default)]
    pub conflicting_entity_id: Option<String>,
    /// Stored state (field map for version conflicts).
    pub current_value: serde_json::Value,
    /// Incoming or offending state.
    pub conflicting_value: serde_json::Value,
    /// Strategies that make sense for this conflict, best first.
    pub suggested_resolution: Vec<ResolutionStrategy>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: ConflictStatus,
    /// Version of the entity when the conflict was detected. Resolutions
    /// write against this version, so a later edit surfaces as a new
    /// conflict instead of being overwritten.
    #[serde(default)]
    pub stored_version: Option<u64>,
}

impl DetectedConflict {
    /// Creates a conflict with a fresh id and default suggestions for its type.
    pub fn new(
        conflict_type: ConflictType,
        severity: ConflictSeverity,
        entity_type: EntityType,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            id: ConflictId::generate(),
            conflict_type,
            severity,
            entity_type,
            entity_id: entity_id.into(),
            conflicting_entity_id: None,
            current_value: serde_json::Value::Null,
            conflicting_value: serde_json::Value::Null,
            suggested_resolution: default_suggestions(conflict_type),
            message: String::new(),
            status: ConflictStatus::Detected,
            stored_version: None,
        }
    }

    /// Sets the two sides of the conflict.
    pub fn with_values(mut self, current: serde_json::Value, conflicting: serde_json::Value) -> Self {
        self.current_value = current;
        self.conflicting_value = conflicting;
        self
    }

    /// Sets the other entity involved.
    pub fn with_conflicting_entity(mut self, id: impl Into<String>) -> Self {
        self.conflicting_entity_id = Some(id.into());
        self
    }

    pub fn with_stored_version(mut self, version: u64) -> Self {
        self.stored_version = Some(version);
        self
    }

    /// Sets the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Field names present on either side, sorted.
    pub fn fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = [&self.current_value, &self.conflicting_value]
            .iter()
            .filter_map(|v| v.as_object())
            .flat_map(|m| m.keys().cloned())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

fn default_suggestions(conflict_type: ConflictType) -> Vec<ResolutionStrategy> {
    use ResolutionStrategy::*;
    match conflict_type {
        ConflictType::OptimisticLocking => vec![Merge, Incoming, Current, Manual],
        ConflictType::DependencyMismatch | ConflictType::SchedulingConflict => {
            vec![Incoming, Manual, Current]
        }
        ConflictType::ResourceOverallocation | ConflictType::DateConstraintViolation => {
            vec![Manual, Current]
        }
        ConflictType::CircularDependency | ConflictType::DataIntegrity => vec![Manual],
    }
}

/// One field change made by a resolution, recorded for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub field: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
    pub strategy: ResolutionStrategy,
}

/// Resolved field values for one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub conflict_id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub values: BTreeMap<String, serde_json::Value>,
}

/// Outcome of a single or bulk resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionResult {
    /// True when every requested conflict was resolved.
    pub success: bool,
    pub strategy: ResolutionStrategy,
    pub resolved_conflicts: Vec<ConflictId>,
    pub remaining_conflicts: Vec<ConflictId>,
    pub resolutions: Vec<Resolution>,
    pub applied_changes: Vec<AppliedChange>,
    /// Per-conflict failure messages.
    pub errors: BTreeMap<ConflictId, String>,
    #[serde(default)]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub recalculated_schedule: Option<Box<SchedulingResult>>,
}

impl ConflictResolutionResult {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self {
            success: false,
            strategy,
            resolved_conflicts: Vec::new(),
            remaining_conflicts: Vec::new(),
            resolutions: Vec::new(),
            applied_changes: Vec::new(),
            errors: BTreeMap::new(),
            backup_id: None,
            recalculated_schedule: None,
        }
    }

    /// Whether some but not all conflicts were resolved.
    pub fn is_partial(&self) -> bool {
        !self.resolved_conflicts.is_empty() && !self.remaining_conflicts.is_empty()
    }
}
