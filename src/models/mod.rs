//! Scheduling domain models.
//!
//! Plain data types shared by every engine component. Inputs (`Task`,
//! `Dependency`, `WorkingHoursConfig`) are snapshots passed by value or
//! reference; outputs (`SchedulingResult`, `DetectedConflict`) are fresh
//! values produced by each operation and never mutated in place.
//!
//! # Client Mappings
//!
//! | gantt-schedule | Gantt client | Issue table |
//! |----------------|--------------|-------------|
//! | Task | Bar | Issue row |
//! | Dependency | Arrow | "Blocked by" |
//! | ScheduledTask | Bar with float overlay | - |
//! | DetectedConflict | Conflict dialog | Stale-edit banner |

mod calendar;
mod conflict;
mod dependency;
mod estimate;
mod schedule;
mod task;

pub use calendar::{CalendarError, WorkingCalendar, WorkingHoursConfig};
pub use conflict::{
    AppliedChange, ConflictId, ConflictIdError, ConflictResolutionResult, ConflictSeverity,
    ConflictStatus, ConflictType, DetectedConflict, Resolution, ResolutionStrategy,
};
pub use dependency::{Anchor, Dependency, DependencyType, LinkRule};
pub use estimate::{probability_of_completion, PertEstimate};
pub use schedule::{
    snapshot_etag, ConvergenceStatus, CriticalPathSegment, PerformanceMetrics, PertSummary,
    ScheduleStatus, ScheduledTask, SchedulingMetrics, SchedulingResult, SchedulingWarning,
    TaskOffsets, WarningKind,
};
pub use task::{rollup_progress, Task, TaskPriority, TaskStatus};

pub(crate) use schedule::sha256_hex;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of persisted entity a conflict or change refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Task,
    Dependency,
    Schedule,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Dependency => "dependency",
            Self::Schedule => "schedule",
        };
        f.write_str(s)
    }
}

/// A versioned, persisted entity.
///
/// Field access goes through the entity's serde representation, so field
/// names are the camelCase wire names (`startDate`, `progress`, ...).
pub trait Entity: Serialize + serde::de::DeserializeOwned {
    const ENTITY_TYPE: EntityType;

    fn entity_id(&self) -> &str;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    /// Current value of a field, `None` if the entity has no such field.
    fn field_value(&self, field: &str) -> Option<serde_json::Value> {
        serde_json::to_value(self).ok()?.get(field).cloned()
    }

    /// Returns a copy with `field` replaced by `value`.
    ///
    /// Identity and version fields cannot be written this way.
    fn with_field(&self, field: &str, value: serde_json::Value) -> Result<Self, FieldError>
    where
        Self: Sized,
    {
        if matches!(field, "id" | "version") {
            return Err(FieldError::ReadOnly(field.to_string()));
        }
        let mut json = serde_json::to_value(self).map_err(|e| FieldError::Invalid {
            field: field.to_string(),
            message: e.to_string(),
        })?;
        let map = json.as_object_mut().ok_or_else(|| FieldError::Invalid {
            field: field.to_string(),
            message: "entity is not an object".to_string(),
        })?;
        if !map.contains_key(field) {
            return Err(FieldError::Unknown(field.to_string()));
        }
        map.insert(field.to_string(), value);
        serde_json::from_value(json).map_err(|e| FieldError::Invalid {
            field: field.to_string(),
            message: e.to_string(),
        })
    }
}

/// Failure to read or write an entity field by name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("unknown field '{0}'")]
    Unknown(String),
    #[error("field '{0}' is read-only")]
    ReadOnly(String),
    #[error("invalid value for field '{field}': {message}")]
    Invalid { field: String, message: String },
}
