//! Cascading reschedule of successors after a task moves.
//!
//! When a task's dates change, every successor whose link is now violated is
//! pushed forward by the minimal delta that satisfies it, level by level
//! (breadth-first) until nothing is violated or a budget runs out.
//!
//! The engine works on a wall-clock snapshot: lags are plain hours and no
//! working calendar is consulted. It never mutates its input; the complete
//! set of before/after pairs comes back as a [`ChangeSet`] the caller can
//! apply or revert as one unit of work.
//!
//! # Budgets
//!
//! | Limit | Default | Effect |
//! |-------|---------|--------|
//! | `max_affected_tasks` | 50 | stop, `abort` |
//! | `max_cascade_depth` | 10 | stop, `abort` |
//! | `performance_threshold_ms` | 1000 | stop, `abort` |
//! | `review_affected_tasks` | 10 | `review` |
//! | `review_cascade_depth` | 3 | `review` |

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::error::{Result, SchedulingError};
use crate::models::{Dependency, Task, TaskStatus};
use crate::scheduler::CancellationFlag;
use crate::validation::{ValidationError, ValidationErrorKind, ValidationErrors};

/// Cascade budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CascadeConfig {
    pub max_affected_tasks: usize,
    pub max_cascade_depth: usize,
    pub performance_threshold_ms: u64,
    /// More affected tasks than this asks for review.
    pub review_affected_tasks: usize,
    /// Deeper cascades than this ask for review.
    pub review_cascade_depth: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            max_affected_tasks: 50,
            max_cascade_depth: 10,
            performance_threshold_ms: 1000,
            review_affected_tasks: 10,
            review_cascade_depth: 3,
        }
    }
}

impl CascadeConfig {
    pub fn with_max_affected_tasks(mut self, max: usize) -> Self {
        self.max_affected_tasks = max;
        self
    }

    pub fn with_max_cascade_depth(mut self, max: usize) -> Self {
        self.max_cascade_depth = max;
        self
    }

    pub fn with_performance_threshold_ms(mut self, ms: u64) -> Self {
        self.performance_threshold_ms = ms;
        self
    }

    pub fn with_review_thresholds(mut self, affected_tasks: usize, cascade_depth: usize) -> Self {
        self.review_affected_tasks = affected_tasks;
        self.review_cascade_depth = cascade_depth;
        self
    }
}

/// What the caller should do with a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendedAction {
    /// Small and safe; apply automatically.
    Proceed,
    /// Apply after the user confirms.
    Review,
    /// A budget was exceeded; do not auto-apply.
    Abort,
}

/// Which budget stopped a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CascadeLimit {
    AffectedTasks,
    CascadeDepth,
    PerformanceThreshold,
}

/// Before/after dates of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskShift {
    pub task_id: String,
    pub before_start: DateTime<Utc>,
    pub before_end: DateTime<Utc>,
    pub after_start: DateTime<Utc>,
    pub after_end: DateTime<Utc>,
    /// 0 for the moved task, n for the n-th wave of successors.
    pub cascade_level: usize,
}

impl TaskShift {
    /// How far the start moved.
    pub fn delta(&self) -> Duration {
        self.after_start - self.before_start
    }
}

/// A task that would have to move but is DONE or CANCELLED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedTask {
    pub task_id: String,
    pub status: TaskStatus,
    /// Earliest start its links now require.
    pub required_start: DateTime<Utc>,
}

/// Outcome of a cascade analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeResult {
    /// The user's move.
    pub moved: TaskShift,
    /// Successors pushed by the move, in the order they were first shifted.
    pub affected_tasks: Vec<TaskShift>,
    /// Deepest level that shifted a task.
    pub cascade_levels: usize,
    pub execution_time_ms: f64,
    pub recommended_action: RecommendedAction,
    pub blocked_tasks: Vec<BlockedTask>,
    /// Set when a budget stopped the cascade early; the shifts are partial.
    pub limit_exceeded: Option<CascadeLimit>,
}

impl CascadeResult {
    /// The move plus every cascaded shift as one undoable unit.
    pub fn change_set(&self) -> ChangeSet {
        let mut shifts = Vec::with_capacity(self.affected_tasks.len() + 1);
        shifts.push(self.moved.clone());
        shifts.extend(self.affected_tasks.iter().cloned());
        ChangeSet { shifts }
    }

    pub fn affected_ids(&self) -> Vec<&str> {
        self.affected_tasks.iter().map(|s| s.task_id.as_str()).collect()
    }
}

/// Compound date change applied or reverted in one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub shifts: Vec<TaskShift>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.shifts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shifts.len()
    }

    /// Sets every task to its `after` dates. Nothing changes if any task is missing.
    pub fn apply(&self, tasks: &mut [Task]) -> Result<()> {
        self.write(tasks, |s| (s.after_start, s.after_end))
    }

    /// Restores every task to its `before` dates. Nothing changes if any task is missing.
    pub fn revert(&self, tasks: &mut [Task]) -> Result<()> {
        self.write(tasks, |s| (s.before_start, s.before_end))
    }

    fn write<F>(&self, tasks: &mut [Task], dates: F) -> Result<()>
    where
        F: Fn(&TaskShift) -> (DateTime<Utc>, DateTime<Utc>),
    {
        let index: HashMap<String, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let mut targets = Vec::with_capacity(self.shifts.len());
        for shift in &self.shifts {
            let &i = index
                .get(&shift.task_id)
                .ok_or_else(|| SchedulingError::TaskNotFound(shift.task_id.clone()))?;
            targets.push((i, dates(shift)));
        }
        for (i, (start, end)) in targets {
            tasks[i].start_date = start;
            tasks[i].end_date = end;
        }
        Ok(())
    }
}

/// Cascade engine.
///
/// # Example
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use gantt_schedule::cascade::{AutoRescheduler, CascadeConfig, RecommendedAction};
/// use gantt_schedule::models::{Dependency, Task};
///
/// let d0 = Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap();
/// let tasks = vec![
///     Task::new("A", d0, d0 + Duration::days(1)),
///     Task::new("B", d0 + Duration::days(1), d0 + Duration::days(2)),
/// ];
/// let deps = vec![Dependency::finish_to_start("A", "B")];
///
/// let result = AutoRescheduler::new(CascadeConfig::default())
///     .reschedule("A", d0 + Duration::days(1), d0 + Duration::days(2), &tasks, &deps)
///     .unwrap();
/// assert_eq!(result.affected_ids(), vec!["B"]);
/// assert_eq!(result.affected_tasks[0].delta(), Duration::days(1));
/// assert_eq!(result.recommended_action, RecommendedAction::Proceed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct AutoRescheduler {
    config: CascadeConfig,
    cancel: Option<CancellationFlag>,
}

impl AutoRescheduler {
    pub fn new(config: CascadeConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Attaches a cancellation flag checked between cascade levels.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Computes the shifts caused by moving `moved_id` to `[new_start, new_end]`.
    ///
    /// Only pushes: a successor that still satisfies its links stays put even
    /// if the move opened a gap.
    pub fn reschedule(
        &self,
        moved_id: &str,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        tasks: &[Task],
        dependencies: &[Dependency],
    ) -> Result<CascadeResult> {
        let started = Instant::now();
        if new_end < new_start {
            return Err(SchedulingError::Validation(ValidationErrors(vec![
                ValidationError::new(
                    ValidationErrorKind::InvalidDateRange,
                    format!("Task '{moved_id}' cannot end before it starts"),
                ),
            ])));
        }

        let index: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let &moved_idx = index
            .get(moved_id)
            .ok_or_else(|| SchedulingError::TaskNotFound(moved_id.to_string()))?;

        let mut successors: Vec<Vec<&Dependency>> = vec![Vec::new(); tasks.len()];
        for dep in dependencies {
            if let (Some(&p), Some(_)) = (
                index.get(dep.predecessor_id.as_str()),
                index.get(dep.successor_id.as_str()),
            ) {
                successors[p].push(dep);
            }
        }

        let mut dates: Vec<(DateTime<Utc>, DateTime<Utc>)> =
            tasks.iter().map(|t| (t.start_date, t.end_date)).collect();
        dates[moved_idx] = (new_start, new_end);

        let moved = &tasks[moved_idx];
        let moved_shift = TaskShift {
            task_id: moved.id.clone(),
            before_start: moved.start_date,
            before_end: moved.end_date,
            after_start: new_start,
            after_end: new_end,
            cascade_level: 0,
        };

        let mut affected: Vec<TaskShift> = Vec::new();
        let mut affected_pos: HashMap<usize, usize> = HashMap::new();
        let mut blocked: Vec<BlockedTask> = Vec::new();
        let mut blocked_pos: HashMap<usize, usize> = HashMap::new();
        let mut limit = None;
        let mut cascade_levels = 0;

        let mut frontier = vec![moved_idx];
        let mut level = 0;
        'levels: while !frontier.is_empty() {
            if let Some(flag) = &self.cancel {
                flag.check()?;
            }
            if started.elapsed().as_millis() > self.config.performance_threshold_ms as u128 {
                limit = Some(CascadeLimit::PerformanceThreshold);
                break;
            }
            level += 1;

            let mut next = Vec::new();
            let mut queued = HashSet::new();
            for &p in &frontier {
                let (pred_start, pred_end) = dates[p];
                for dep in &successors[p] {
                    let Some(&s) = index.get(dep.successor_id.as_str()) else {
                        continue;
                    };
                    if s == moved_idx {
                        continue;
                    }
                    let (succ_start, succ_end) = dates[s];
                    let required = dep.rule().earliest_successor_start(
                        pred_start,
                        pred_end,
                        succ_end - succ_start,
                        dep.lag_duration(),
                    );
                    if succ_start >= required {
                        continue;
                    }

                    let task = &tasks[s];
                    if !task.status.is_movable() {
                        match blocked_pos.get(&s).copied() {
                            Some(b) => {
                                blocked[b].required_start = blocked[b].required_start.max(required)
                            }
                            None => {
                                blocked_pos.insert(s, blocked.len());
                                blocked.push(BlockedTask {
                                    task_id: task.id.clone(),
                                    status: task.status,
                                    required_start: required,
                                });
                            }
                        }
                        continue;
                    }

                    if level > self.config.max_cascade_depth {
                        limit = Some(CascadeLimit::CascadeDepth);
                        break 'levels;
                    }
                    if !affected_pos.contains_key(&s)
                        && affected.len() >= self.config.max_affected_tasks
                    {
                        limit = Some(CascadeLimit::AffectedTasks);
                        break 'levels;
                    }

                    let delta = required - succ_start;
                    dates[s] = (required, succ_end + delta);
                    match affected_pos.get(&s).copied() {
                        Some(a) => {
                            affected[a].after_start = required;
                            affected[a].after_end = succ_end + delta;
                            affected[a].cascade_level = level;
                        }
                        None => {
                            affected_pos.insert(s, affected.len());
                            affected.push(TaskShift {
                                task_id: task.id.clone(),
                                before_start: task.start_date,
                                before_end: task.end_date,
                                after_start: required,
                                after_end: succ_end + delta,
                                cascade_level: level,
                            });
                        }
                    }
                    cascade_levels = level;
                    if queued.insert(s) {
                        next.push(s);
                    }
                }
            }
            frontier = next;
        }

        let recommended_action = if limit.is_some() {
            RecommendedAction::Abort
        } else if affected.len() > self.config.review_affected_tasks
            || cascade_levels > self.config.review_cascade_depth
            || !blocked.is_empty()
        {
            RecommendedAction::Review
        } else {
            RecommendedAction::Proceed
        };

        Ok(CascadeResult {
            moved: moved_shift,
            affected_tasks: affected,
            cascade_levels,
            execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            recommended_action,
            blocked_tasks: blocked,
            limit_exceeded: limit,
        })
    }
}
