//! Task model.
//!
//! A task is the schedulable unit of a project: a dated bar on the Gantt
//! chart with progress, status, an optional assignee, and a `version` used
//! for optimistic locking.
//!
//! # Hierarchy
//! `parent_id` links tasks into a WBS tree. The hierarchy is structural only:
//! the scheduler ignores it. The one hierarchy rule, that a parent's progress
//! is derived from its children, is applied at the edge via [`rollup_progress`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Entity, EntityType, PertEstimate};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Cancelled,
}

impl TaskStatus {
    /// Whether the cascade engine may move a task in this status.
    pub fn is_movable(self) -> bool {
        matches!(self, Self::Todo | Self::InProgress)
    }
}

/// Task priority as shown in the issue table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// A task to be scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Planned start.
    pub start_date: DateTime<Utc>,
    /// Planned end.
    pub end_date: DateTime<Utc>,
    /// Completion percentage (0-100).
    pub progress: u8,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Effort estimate in hours, if any.
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    /// Optimistic-locking version, bumped on every persisted write.
    pub version: u64,
    /// WBS parent.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Assigned user, used for overallocation checks and utilization.
    #[serde(default)]
    pub assignee_id: Option<String>,
    /// Zero-duration tasks flagged as milestones are not reported as unrealistic.
    #[serde(default)]
    pub is_milestone: bool,
    /// Three-point estimate for PERT scheduling.
    #[serde(default)]
    pub pert: Option<PertEstimate>,
}

impl Task {
    /// Creates a TODO task spanning `[start, end]` at version 1.
    pub fn new(id: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            start_date: start,
            end_date: end,
            progress: 0,
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            estimated_hours: None,
            version: 1,
            parent_id: None,
            assignee_id: None,
            is_milestone: false,
            pert: None,
        }
    }

    /// Sets the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets progress, clamped to 100.
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }

    /// Sets the effort estimate.
    pub fn with_estimated_hours(mut self, hours: f64) -> Self {
        self.estimated_hours = Some(hours);
        self
    }

    /// Sets the version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Sets the WBS parent.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Sets the assignee.
    pub fn with_assignee(mut self, assignee_id: impl Into<String>) -> Self {
        self.assignee_id = Some(assignee_id.into());
        self
    }

    /// Marks the task as a milestone.
    pub fn as_milestone(mut self) -> Self {
        self.is_milestone = true;
        self
    }

    /// Attaches a PERT estimate.
    pub fn with_pert(mut self, pert: PertEstimate) -> Self {
        self.pert = Some(pert);
        self
    }

    /// Wall-clock span between planned start and end.
    pub fn span(&self) -> chrono::Duration {
        self.end_date - self.start_date
    }
}

impl Entity for Task {
    const ENTITY_TYPE: EntityType = EntityType::Task;

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Recomputes the progress of every WBS parent from its children.
///
/// A parent's progress is the mean of its children's progress weighted by
/// `estimated_hours` (weight 1 when absent or non-positive). Parents are
/// processed deepest first so nested summaries see updated children.
/// Orphaned `parent_id` references are ignored.
pub fn rollup_progress(tasks: &mut [Task]) {
    let index: HashMap<String, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.clone(), i))
        .collect();

    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, task) in tasks.iter().enumerate() {
        if let Some(&p) = task.parent_id.as_ref().and_then(|pid| index.get(pid)) {
            if p != i {
                children.entry(p).or_default().push(i);
            }
        }
    }

    let mut parents: Vec<(usize, usize)> = children
        .keys()
        .map(|&p| (depth(p, tasks, &index), p))
        .collect();
    // Deepest first; index as a tie-breaker keeps the pass deterministic.
    parents.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    for (_, p) in parents {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for &c in &children[&p] {
            let weight = tasks[c].estimated_hours.filter(|h| *h > 0.0).unwrap_or(1.0);
            weighted += tasks[c].progress as f64 * weight;
            total_weight += weight;
        }
        if total_weight > 0.0 {
            tasks[p].progress = (weighted / total_weight).round().clamp(0.0, 100.0) as u8;
        }
    }
}

fn depth(start: usize, tasks: &[Task], index: &HashMap<String, usize>) -> usize {
    let mut depth = 0;
    let mut current = start;
    // Bounded walk so a malformed parent loop cannot spin forever.
    while depth < tasks.len() {
        match tasks[current].parent_id.as_ref().and_then(|pid| index.get(pid)) {
            Some(&p) if p != current => {
                depth += 1;
                current = p;
            }
            _ => break,
        }
    }
    depth
}
