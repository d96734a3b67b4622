//! Two-pass CPM over working-hour offsets.
//!
//! # Complexity
//! O(V + E) per pass, plus O(V log V) for the validation and level grouping.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use super::{metrics, CancellationFlag, DurationSource, SchedulingOptions};
use crate::error::{Result, SchedulingError};
use crate::models::{
    sha256_hex, snapshot_etag, ConvergenceStatus, CriticalPathSegment, Dependency, DependencyType,
    LinkRule, PerformanceMetrics, ScheduleStatus, ScheduledTask, SchedulingMetrics,
    SchedulingResult, SchedulingWarning, Task, TaskOffsets, TaskStatus, WarningKind,
    WorkingCalendar,
};
use crate::validation::{detect_cycles, topological_levels, validate_input};
use crate::validation::{ValidationError, ValidationErrorKind, ValidationErrors};

/// Progress points above the expected value needed for `AHEAD`.
const AHEAD_MARGIN: f64 = 10.0;

/// One side of a dependency as seen from a task.
#[derive(Debug, Clone, Copy)]
struct Link {
    /// Index of the task on the other end.
    task: usize,
    rule: LinkRule,
    lag: i64,
    dependency_type: DependencyType,
}

/// Offsets produced by both passes.
#[derive(Debug, Clone)]
struct Passes {
    es: Vec<i64>,
    ef: Vec<i64>,
    ls: Vec<i64>,
    lf: Vec<i64>,
    project_end: i64,
    iterations: u32,
}

/// Critical path (CPM) scheduler.
///
/// # Example
/// ```
/// use chrono::{TimeZone, Utc};
/// use gantt_schedule::models::{Dependency, Task, WorkingHoursConfig};
/// use gantt_schedule::scheduler::{CriticalPathScheduler, SchedulingOptions};
///
/// let calendar = WorkingHoursConfig::continuous().build().unwrap();
/// let d0 = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
/// let tasks = vec![
///     Task::new("t1", d0, d0 + chrono::Duration::days(2)),
///     Task::new("t2", d0 + chrono::Duration::days(2), d0 + chrono::Duration::days(5)),
/// ];
/// let deps = vec![Dependency::finish_to_start("t1", "t2")];
///
/// let result = CriticalPathScheduler::new(calendar)
///     .calculate(&tasks, &deps, &SchedulingOptions::default())
///     .unwrap();
/// let (t1, t2) = (result.task("t1").unwrap(), result.task("t2").unwrap());
/// assert_eq!(t2.earliest_start, t1.earliest_finish);
/// assert!(t1.is_critical && t2.is_critical);
/// ```
#[derive(Debug, Clone)]
pub struct CriticalPathScheduler {
    calendar: WorkingCalendar,
    cancel: Option<CancellationFlag>,
}

impl CriticalPathScheduler {
    pub fn new(calendar: WorkingCalendar) -> Self {
        Self {
            calendar,
            cancel: None,
        }
    }

    /// Attaches a cancellation flag checked between topological levels.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn calendar(&self) -> &WorkingCalendar {
        &self.calendar
    }

    /// Computes a fresh schedule for the snapshot.
    ///
    /// Cancelled tasks and their dependencies are left out (with an
    /// `EXCLUDED_TASK` warning) but still count towards the etag.
    ///
    /// # Errors
    /// - `Validation` if the snapshot is structurally invalid (cycle, unknown task, …)
    /// - `Calculation` if more than `max_iterations` levels would be processed
    /// - `Cancelled` if the cancellation flag is raised mid-calculation
    pub fn calculate(
        &self,
        tasks: &[Task],
        dependencies: &[Dependency],
        options: &SchedulingOptions,
    ) -> Result<SchedulingResult> {
        let started = Instant::now();
        validate_input(tasks, dependencies)?;
        self.check_cancelled()?;

        let etag = snapshot_etag(tasks, dependencies);
        let schedule_id = schedule_id(&etag, options);

        let active: Vec<Task> = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Cancelled)
            .cloned()
            .collect();
        let active_ids: HashSet<&str> = active.iter().map(|t| t.id.as_str()).collect();
        let deps: Vec<Dependency> = dependencies
            .iter()
            .filter(|d| {
                active_ids.contains(d.predecessor_id.as_str())
                    && active_ids.contains(d.successor_id.as_str())
            })
            .cloned()
            .collect();

        let mut warnings = Vec::new();
        let excluded: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Cancelled)
            .map(|t| t.id.clone())
            .collect();
        if !excluded.is_empty() {
            let message = format!(
                "{} cancelled task(s) excluded from scheduling: {}",
                excluded.len(),
                excluded.join(", ")
            );
            warnings.push(SchedulingWarning::new(WarningKind::ExcludedTask, excluded, message));
        }

        let Some(first_start) = active.iter().map(|t| t.start_date).min() else {
            return Ok(empty_result(
                schedule_id,
                etag,
                tasks.len(),
                warnings,
                started,
            ));
        };
        let origin = self
            .calendar
            .next_working_instant(options.project_start.unwrap_or(first_start));

        let durations: Vec<i64> = active
            .iter()
            .map(|t| self.duration_hours(t, options.duration_source))
            .collect();
        let planned: Vec<i64> = active
            .iter()
            .map(|t| {
                let start = self.calendar.next_working_instant(t.start_date);
                self.calendar.working_hours_between(origin, start)
            })
            .collect();
        let release: Vec<i64> = if options.respect_task_dates {
            planned.iter().map(|p| (*p).max(0)).collect()
        } else {
            vec![0; active.len()]
        };

        let levels = topological_levels(&active, &deps).ok_or_else(|| cycle_error(&deps))?;
        let (preds, succs) = build_links(&active, &deps);
        let passes = self.run_passes(
            &levels,
            &durations,
            &release,
            &preds,
            &succs,
            options.max_iterations,
        )?;

        let mut scheduled = Vec::with_capacity(active.len());
        for (i, task) in active.iter().enumerate() {
            let offsets = TaskOffsets {
                earliest_start: passes.es[i],
                earliest_finish: passes.ef[i],
                latest_start: passes.ls[i],
                latest_finish: passes.lf[i],
            };
            let total_slack = passes.ls[i] - passes.es[i];
            let free_slack = free_slack(i, &passes, &succs).max(0).min(total_slack);
            let is_critical = total_slack == 0;
            let (earliest_start, earliest_finish) =
                self.dates(origin, passes.es[i], passes.ef[i], durations[i]);
            let (latest_start, latest_finish) =
                self.dates(origin, passes.ls[i], passes.lf[i], durations[i]);

            scheduled.push(ScheduledTask {
                task: task.clone(),
                duration_hours: durations[i],
                earliest_start,
                earliest_finish,
                latest_start,
                latest_finish,
                offsets,
                total_slack,
                free_slack,
                is_critical,
                schedule_status: schedule_status(
                    task,
                    passes.es[i],
                    planned[i],
                    is_critical,
                    options.status_date,
                ),
            });
        }

        let critical_path: Vec<CriticalPathSegment> =
            critical_chain(&levels, &durations, &passes, &preds)
                .into_iter()
                .map(|(i, link)| {
                    let st = &scheduled[i];
                    CriticalPathSegment {
                        task_id: st.task.id.clone(),
                        title: st.task.title.clone(),
                        start: st.earliest_start,
                        end: st.earliest_finish,
                        duration_hours: st.duration_hours,
                        link_from_previous: link,
                    }
                })
                .collect();

        warnings.extend(metrics::find_overallocations(&scheduled));
        warnings.extend(metrics::find_unrealistic_durations(
            &scheduled,
            options.max_task_hours,
        ));

        let pert = (options.duration_source == DurationSource::Pert)
            .then(|| metrics::pert_summary(&scheduled, &critical_path))
            .flatten();

        let metrics = SchedulingMetrics {
            total_tasks: tasks.len(),
            scheduled_tasks: scheduled.len(),
            critical_tasks: scheduled.iter().filter(|t| t.is_critical).count(),
            total_dependencies: deps.len(),
            project_start: Some(origin),
            project_end: Some(self.calendar.offset_to_finish(origin, passes.project_end)),
            project_duration_hours: passes.project_end,
            resource_utilization: metrics::resource_utilization(&scheduled, passes.project_end),
            performance: PerformanceMetrics {
                calculation_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                iterations: passes.iterations,
                convergence_status: ConvergenceStatus::Converged,
            },
            pert,
        };

        Ok(SchedulingResult {
            schedule_id,
            tasks: scheduled,
            dependencies: deps,
            critical_path,
            metrics,
            warnings,
            etag,
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) => flag.check(),
            None => Ok(()),
        }
    }

    fn duration_hours(&self, task: &Task, source: DurationSource) -> i64 {
        let from_dates = || {
            self.calendar
                .working_hours_between(task.start_date, task.end_date)
                .max(0)
        };
        let from_estimate = || {
            task.estimated_hours
                .filter(|h| *h >= 0.0)
                .map(|h| h.ceil() as i64)
        };
        match source {
            DurationSource::Dates => from_dates(),
            DurationSource::EstimatedHours => from_estimate().unwrap_or_else(from_dates),
            DurationSource::Pert => task
                .pert
                .filter(|p| p.is_consistent())
                .map(|p| p.mean().ceil() as i64)
                .or_else(from_estimate)
                .unwrap_or_else(from_dates),
        }
    }

    /// Start and finish instants for a pair of offsets.
    fn dates(
        &self,
        origin: DateTime<Utc>,
        start: i64,
        finish: i64,
        duration: i64,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let start_at = self.calendar.offset_to_start(origin, start);
        if duration == 0 {
            return (start_at, start_at);
        }
        (start_at, self.calendar.offset_to_finish(origin, finish))
    }

    fn run_passes(
        &self,
        levels: &[Vec<usize>],
        durations: &[i64],
        release: &[i64],
        preds: &[Vec<Link>],
        succs: &[Vec<Link>],
        max_iterations: u32,
    ) -> Result<Passes> {
        let n = durations.len();
        let mut es = vec![0i64; n];
        let mut ef = vec![0i64; n];
        let mut iterations = 0u32;

        // Forward pass
        for level in levels {
            iterations = self.next_iteration(iterations, max_iterations)?;
            for &s in level {
                let mut start = release[s].max(0);
                for link in &preds[s] {
                    let p = link.task;
                    start = start.max(link.rule.earliest_successor_start(
                        es[p],
                        ef[p],
                        durations[s],
                        link.lag,
                    ));
                }
                es[s] = start;
                ef[s] = start + durations[s];
            }
        }

        let project_end = ef.iter().copied().max().unwrap_or(0);
        let mut ls = vec![0i64; n];
        let mut lf = vec![0i64; n];

        // Backward pass
        for level in levels.iter().rev() {
            iterations = self.next_iteration(iterations, max_iterations)?;
            for &p in level {
                let mut finish = project_end;
                for link in &succs[p] {
                    let s = link.task;
                    finish = finish.min(link.rule.latest_predecessor_finish(
                        ls[s],
                        lf[s],
                        durations[p],
                        link.lag,
                    ));
                }
                lf[p] = finish;
                ls[p] = finish - durations[p];
            }
        }

        Ok(Passes {
            es,
            ef,
            ls,
            lf,
            project_end,
            iterations,
        })
    }

    fn next_iteration(&self, done: u32, max_iterations: u32) -> Result<u32> {
        self.check_cancelled()?;
        let next = done + 1;
        if next > max_iterations {
            return Err(SchedulingError::Calculation {
                iterations: next,
                max_iterations,
            });
        }
        Ok(next)
    }
}

fn build_links(tasks: &[Task], deps: &[Dependency]) -> (Vec<Vec<Link>>, Vec<Vec<Link>>) {
    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut preds = vec![Vec::new(); tasks.len()];
    let mut succs = vec![Vec::new(); tasks.len()];

    for dep in deps {
        let (Some(&p), Some(&s)) = (
            index.get(dep.predecessor_id.as_str()),
            index.get(dep.successor_id.as_str()),
        ) else {
            continue;
        };
        let link = |task| Link {
            task,
            rule: dep.rule(),
            lag: dep.lag,
            dependency_type: dep.dependency_type,
        };
        preds[s].push(link(p));
        succs[p].push(link(s));
    }
    (preds, succs)
}

/// Gap between a task's early position and the tightest successor constraint.
fn free_slack(i: usize, passes: &Passes, succs: &[Vec<Link>]) -> i64 {
    let (es, ef) = (&passes.es, &passes.ef);
    succs[i]
        .iter()
        .map(|link| {
            let s = link.task;
            link.rule.successor.pick(es[s], ef[s])
                - (link.rule.predecessor.pick(es[i], ef[i]) + link.lag)
        })
        .min()
        .unwrap_or(passes.project_end - ef[i])
}

/// Longest chain of critical tasks joined by driving links, ending at the
/// project end. Returns task indices in path order with the incoming link type.
fn critical_chain(
    levels: &[Vec<usize>],
    durations: &[i64],
    passes: &Passes,
    preds: &[Vec<Link>],
) -> Vec<(usize, Option<DependencyType>)> {
    let n = durations.len();
    let critical: Vec<bool> = (0..n).map(|i| passes.ls[i] == passes.es[i]).collect();
    // (hours, task count, previous task and link)
    let mut best: Vec<Option<(i64, usize, Option<(usize, DependencyType)>)>> = vec![None; n];

    for &i in levels.iter().flatten() {
        if !critical[i] {
            continue;
        }
        let mut value = (durations[i], 1usize);
        let mut from = None;
        for link in &preds[i] {
            let p = link.task;
            if !critical[p] {
                continue;
            }
            let driving = link.rule.successor.pick(passes.es[i], passes.ef[i])
                == link.rule.predecessor.pick(passes.es[p], passes.ef[p]) + link.lag;
            if let (true, Some((hours, count, _))) = (driving, best[p]) {
                let candidate = (hours + durations[i], count + 1);
                if candidate > value {
                    value = candidate;
                    from = Some((p, link.dependency_type));
                }
            }
        }
        best[i] = Some((value.0, value.1, from));
    }

    let mut end: Option<(usize, (i64, usize))> = None;
    for &i in levels.iter().flatten() {
        let Some((hours, count, _)) = best[i] else {
            continue;
        };
        if passes.ef[i] != passes.project_end {
            continue;
        }
        if end.map_or(true, |(_, v)| (hours, count) > v) {
            end = Some((i, (hours, count)));
        }
    }

    let mut chain = Vec::new();
    let mut cursor = end.map(|(i, _)| i);
    while let Some(i) = cursor {
        if chain.len() > n {
            break;
        }
        let from = best[i].and_then(|(_, _, from)| from);
        chain.push((i, from.map(|(_, ty)| ty)));
        cursor = from.map(|(p, _)| p);
    }
    chain.reverse();
    chain
}

fn schedule_status(
    task: &Task,
    earliest_start: i64,
    planned_start: i64,
    is_critical: bool,
    status_date: Option<DateTime<Utc>>,
) -> ScheduleStatus {
    if earliest_start > planned_start {
        return ScheduleStatus::Delayed;
    }
    if is_critical {
        return ScheduleStatus::Critical;
    }
    if let Some(at) = status_date {
        if task.progress as f64 > expected_progress(task, at) + AHEAD_MARGIN {
            return ScheduleStatus::Ahead;
        }
    }
    ScheduleStatus::OnSchedule
}

/// Linear progress expected at `at` over the planned span, in percent.
fn expected_progress(task: &Task, at: DateTime<Utc>) -> f64 {
    if at <= task.start_date {
        return 0.0;
    }
    if at >= task.end_date {
        return 100.0;
    }
    let total = (task.end_date - task.start_date).num_seconds() as f64;
    let elapsed = (at - task.start_date).num_seconds() as f64;
    elapsed / total * 100.0
}

fn schedule_id(etag: &str, options: &SchedulingOptions) -> String {
    let options = serde_json::to_string(options).unwrap_or_default();
    let digest = sha256_hex(format!("{etag}\n{options}").as_bytes());
    format!("SCHEDULE-{}", &digest[..16])
}

fn cycle_error(deps: &[Dependency]) -> SchedulingError {
    let path = detect_cycles(deps).unwrap_or_default();
    SchedulingError::Validation(ValidationErrors(vec![ValidationError::new(
        ValidationErrorKind::CyclicDependency,
        format!("Circular dependency detected: {}", path.join(" → ")),
    )]))
}

fn empty_result(
    schedule_id: String,
    etag: String,
    total_tasks: usize,
    warnings: Vec<SchedulingWarning>,
    started: Instant,
) -> SchedulingResult {
    SchedulingResult {
        schedule_id,
        tasks: Vec::new(),
        dependencies: Vec::new(),
        critical_path: Vec::new(),
        metrics: SchedulingMetrics {
            total_tasks,
            scheduled_tasks: 0,
            critical_tasks: 0,
            total_dependencies: 0,
            project_start: None,
            project_end: None,
            project_duration_hours: 0,
            resource_utilization: Default::default(),
            performance: PerformanceMetrics {
                calculation_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                iterations: 0,
                convergence_status: ConvergenceStatus::Empty,
            },
            pert: None,
        },
        warnings,
        etag,
    }
}
