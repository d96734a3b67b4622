//! Schedule calculation output.
//!
//! A [`SchedulingResult`] is produced fresh by every calculation and tagged
//! with an `etag` derived from the input snapshot (task and dependency ids
//! and versions). Applying a result later is only allowed while the stored
//! snapshot still hashes to the same etag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sha2::{Digest, Sha256};

use super::{probability_of_completion, Dependency, DependencyType, Task};

/// Derived timing of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    /// The input task, unchanged.
    #[serde(flatten)]
    pub task: Task,
    /// Working-hour duration used by the calculation.
    pub duration_hours: i64,
    /// Start instant, snapped forward to working time.
    ///
    /// Link arithmetic is exact in [`offsets`](Self::offsets): an FS
    /// successor with zero lag has `offsets.earliest_start` equal to its
    /// predecessor's `offsets.earliest_finish`. The dates can differ on a
    /// working calendar, because a finish at the end of a working day stays
    /// there while the next start moves to the following working window
    /// (Tue 17:00 finish, Wed 09:00 start). On a continuous calendar they
    /// are equal.
    pub earliest_start: DateTime<Utc>,
    /// Finish instant; a finish at the end of a working day is not rolled over.
    pub earliest_finish: DateTime<Utc>,
    pub latest_start: DateTime<Utc>,
    pub latest_finish: DateTime<Utc>,
    /// Timing as working-hour offsets from the project start.
    pub offsets: TaskOffsets,
    /// `latest_start - earliest_start`, in working hours.
    pub total_slack: i64,
    /// Delay (hours) absorbable without moving any successor's earliest start.
    pub free_slack: i64,
    pub is_critical: bool,
    pub schedule_status: ScheduleStatus,
}

impl ScheduledTask {
    #[inline]
    pub fn id(&self) -> &str {
        &self.task.id
    }
}

/// CPM times as working-hour offsets from the project start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOffsets {
    pub earliest_start: i64,
    pub earliest_finish: i64,
    pub latest_start: i64,
    pub latest_finish: i64,
}

/// Summary state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    OnSchedule,
    /// Dependencies push the task past its planned start.
    Delayed,
    /// Progress is ahead of where the status date expects it.
    Ahead,
    /// On the critical path.
    Critical,
}

/// One task on the critical path, in path order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalPathSegment {
    pub task_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_hours: i64,
    /// Link type from the previous segment; `None` for the first.
    pub link_from_previous: Option<DependencyType>,
}

/// How the calculation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConvergenceStatus {
    Converged,
    /// Nothing to schedule.
    Empty,
}

/// Timing of the calculation itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub calculation_time_ms: f64,
    /// Topological levels processed across both passes.
    pub iterations: u32,
    pub convergence_status: ConvergenceStatus,
}

/// PERT statistics along the critical path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PertSummary {
    pub expected_duration_hours: f64,
    pub std_dev_hours: f64,
}

impl PertSummary {
    /// Probability of finishing the critical path within `target_hours`.
    pub fn probability_of_completion(&self, target_hours: f64) -> f64 {
        probability_of_completion(self.expected_duration_hours, self.std_dev_hours, target_hours)
    }
}

/// Aggregate numbers for a calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingMetrics {
    pub total_tasks: usize,
    pub scheduled_tasks: usize,
    pub critical_tasks: usize,
    pub total_dependencies: usize,
    pub project_start: Option<DateTime<Utc>>,
    pub project_end: Option<DateTime<Utc>>,
    pub project_duration_hours: i64,
    /// Busy hours / project duration per assignee.
    pub resource_utilization: BTreeMap<String, f64>,
    pub performance: PerformanceMetrics,
    #[serde(default)]
    pub pert: Option<PertSummary>,
}

/// Category of a non-fatal finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    ResourceOverallocation,
    UnrealisticDuration,
    ExcludedTask,
}

/// A non-fatal issue found while scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingWarning {
    pub kind: WarningKind,
    pub task_ids: Vec<String>,
    pub message: String,
}

impl SchedulingWarning {
    pub fn new(kind: WarningKind, task_ids: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            task_ids,
            message: message.into(),
        }
    }
}

/// Result of one schedule calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingResult {
    pub schedule_id: String,
    /// Scheduled tasks in input order.
    pub tasks: Vec<ScheduledTask>,
    /// Dependencies the calculation used.
    pub dependencies: Vec<Dependency>,
    pub critical_path: Vec<CriticalPathSegment>,
    pub metrics: SchedulingMetrics,
    pub warnings: Vec<SchedulingWarning>,
    /// Hash of the input snapshot; see [`snapshot_etag`].
    pub etag: String,
}

impl SchedulingResult {
    /// Finds a scheduled task by id.
    pub fn task(&self, id: &str) -> Option<&ScheduledTask> {
        self.tasks.iter().find(|t| t.id() == id)
    }

    /// Ids of all critical tasks, in input order.
    pub fn critical_task_ids(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.is_critical)
            .map(|t| t.id())
            .collect()
    }

    /// Task ids along the critical path, in path order.
    pub fn critical_path_ids(&self) -> Vec<&str> {
        self.critical_path.iter().map(|s| s.task_id.as_str()).collect()
    }
}

/// Deterministic etag of a task/dependency snapshot.
///
/// SHA-256 over one `kind\tid\tversion` line per entity, tasks before
/// dependencies, each group sorted by id. Depends only on ids and
/// versions, independent of input order and of the toolchain.
pub fn snapshot_etag(tasks: &[Task], dependencies: &[Dependency]) -> String {
    let mut entries: Vec<(u8, &str, u64)> = tasks
        .iter()
        .map(|t| (0u8, t.id.as_str(), t.version))
        .chain(dependencies.iter().map(|d| (1u8, d.id.as_str(), d.version)))
        .collect();
    entries.sort_unstable();

    let mut hasher = Sha256::new();
    for (kind, id, version) in entries {
        let kind = if kind == 0 { "task" } else { "dependency" };
        hasher.update(format!("{kind}\t{id}\t{version}\n").as_bytes());
    }
    format!("W/\"{:x}\"", hasher.finalize())
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
