//! Schedule metrics and warnings.
//!
//! Computes per-resource indicators and non-fatal findings from a
//! calculated schedule.
//!
//! # Metrics
//!
//! | Metric | Definition |
//! |--------|-----------|
//! | Utilization | Busy working hours / project duration, per assignee |
//! | Overallocation | Same assignee on overlapping earliest intervals |
//! | Unrealistic duration | Zero hours (non-milestone) or above the limit |
//! | PERT summary | Σ mean and √Σ variance along the critical path |
//!
//! # Reference
//! Pinedo (2016), "Scheduling", Ch. 1.2: Performance Measures

use std::collections::BTreeMap;

use crate::models::{
    CriticalPathSegment, PertSummary, ScheduledTask, SchedulingWarning, WarningKind,
};

/// Busy hours over project hours, per assignee.
///
/// Unassigned tasks are ignored. A zero-length project yields 0.0.
pub fn resource_utilization(tasks: &[ScheduledTask], project_hours: i64) -> BTreeMap<String, f64> {
    let mut busy: BTreeMap<String, i64> = BTreeMap::new();
    for t in tasks {
        if let Some(assignee) = &t.task.assignee_id {
            *busy.entry(assignee.clone()).or_default() += t.duration_hours;
        }
    }
    busy.into_iter()
        .map(|(assignee, hours)| {
            let utilization = if project_hours > 0 {
                hours as f64 / project_hours as f64
            } else {
                0.0
            };
            (assignee, utilization)
        })
        .collect()
}

/// One warning per group of overlapping tasks sharing an assignee.
///
/// Uses earliest offsets; zero-duration tasks never overlap.
pub fn find_overallocations(tasks: &[ScheduledTask]) -> Vec<SchedulingWarning> {
    let mut by_assignee: BTreeMap<&str, Vec<(i64, i64, &str)>> = BTreeMap::new();
    for t in tasks {
        if t.duration_hours <= 0 {
            continue;
        }
        if let Some(assignee) = &t.task.assignee_id {
            by_assignee.entry(assignee.as_str()).or_default().push((
                t.offsets.earliest_start,
                t.offsets.earliest_finish,
                t.id(),
            ));
        }
    }

    let mut warnings = Vec::new();
    for (assignee, mut intervals) in by_assignee {
        intervals.sort_unstable();
        let mut group: Vec<&str> = Vec::new();
        let mut group_end = i64::MIN;

        let mut flush = |group: &mut Vec<&str>| {
            if group.len() > 1 {
                warnings.push(SchedulingWarning::new(
                    WarningKind::ResourceOverallocation,
                    group.iter().map(|s| s.to_string()).collect(),
                    format!(
                        "'{assignee}' is booked on overlapping tasks: {}",
                        group.join(", ")
                    ),
                ));
            }
            group.clear();
        };

        for (start, finish, id) in intervals {
            if start >= group_end {
                flush(&mut group);
                group_end = finish;
            } else {
                group_end = group_end.max(finish);
            }
            group.push(id);
        }
        flush(&mut group);
    }
    warnings
}

/// Zero-hour non-milestones and tasks longer than `max_hours`.
pub fn find_unrealistic_durations(tasks: &[ScheduledTask], max_hours: i64) -> Vec<SchedulingWarning> {
    tasks
        .iter()
        .filter_map(|t| {
            let message = if t.duration_hours == 0 && !t.task.is_milestone {
                format!("Task '{}' has no working time", t.id())
            } else if t.duration_hours > max_hours {
                format!(
                    "Task '{}' spans {}h, more than the {}h limit",
                    t.id(),
                    t.duration_hours,
                    max_hours
                )
            } else {
                return None;
            };
            Some(SchedulingWarning::new(
                WarningKind::UnrealisticDuration,
                vec![t.id().to_string()],
                message,
            ))
        })
        .collect()
}

/// PERT expectation and spread along the critical path.
///
/// Tasks without a three-point estimate contribute their scheduled
/// duration with zero variance. `None` for an empty path.
pub fn pert_summary(tasks: &[ScheduledTask], path: &[CriticalPathSegment]) -> Option<PertSummary> {
    if path.is_empty() {
        return None;
    }
    let mut mean = 0.0;
    let mut variance = 0.0;
    for segment in path {
        let task = tasks.iter().find(|t| t.id() == segment.task_id)?;
        match task.task.pert.filter(|p| p.is_consistent()) {
            Some(pert) => {
                mean += pert.mean();
                variance += pert.variance();
            }
            None => mean += task.duration_hours as f64,
        }
    }
    Some(PertSummary {
        expected_duration_hours: mean,
        std_dev_hours: variance.sqrt(),
    })
}
