//! Critical path scheduling and schedule metrics.
//!
//! # Algorithm
//!
//! `CriticalPathScheduler` runs the standard two-pass CPM over working-hour
//! offsets from the project start:
//!
//! 1. Validate the snapshot (fail closed on cycles and bad references).
//! 2. Group tasks into topological levels.
//! 3. Forward pass: earliest start/finish, honouring every link rule and lag.
//! 4. Backward pass from the project end: latest start/finish.
//! 5. Slack, critical flags, critical path, status, and warnings.
//!
//! Calendar conversion happens only at the boundary: durations come in via
//! [`WorkingCalendar::working_hours_between`] and dates go out via
//! [`WorkingCalendar::offset_to_start`] / [`WorkingCalendar::offset_to_finish`].
//!
//! # Cancellation
//!
//! A [`CancellationFlag`] is checked before every topological level in both
//! passes, so an abort on a large graph stops promptly.
//!
//! # References
//!
//! - Kelley & Walker (1959), "Critical-Path Planning and Scheduling"
//! - PMI (2017), "PMBOK Guide", 6th ed., §6.5.2.2 (Critical Path Method)

mod cpm;
mod metrics;

pub use cpm::CriticalPathScheduler;
pub use metrics::{
    find_overallocations, find_unrealistic_durations, pert_summary, resource_utilization,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, SchedulingError};

/// Where task durations come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurationSource {
    /// Working hours between the task's planned start and end.
    #[default]
    Dates,
    /// `estimatedHours`, falling back to dates.
    EstimatedHours,
    /// PERT mean, falling back to `estimatedHours`, then dates.
    Pert,
}

/// Options for one schedule calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulingOptions {
    /// Project start; defaults to the earliest task start.
    pub project_start: Option<DateTime<Utc>>,
    pub duration_source: DurationSource,
    /// Treat each task's planned start as a start-no-earlier-than constraint.
    pub respect_task_dates: bool,
    /// Upper bound on topological levels processed across both passes.
    pub max_iterations: u32,
    /// Reference date for `AHEAD` status.
    pub status_date: Option<DateTime<Utc>>,
    /// Tasks longer than this many working hours are reported as unrealistic.
    pub max_task_hours: i64,
}

impl Default for SchedulingOptions {
    fn default() -> Self {
        Self {
            project_start: None,
            duration_source: DurationSource::Dates,
            respect_task_dates: true,
            max_iterations: 10_000,
            status_date: None,
            max_task_hours: 2_000,
        }
    }
}

impl SchedulingOptions {
    pub fn with_project_start(mut self, start: DateTime<Utc>) -> Self {
        self.project_start = Some(start);
        self
    }

    pub fn with_duration_source(mut self, source: DurationSource) -> Self {
        self.duration_source = source;
        self
    }

    pub fn with_respect_task_dates(mut self, respect: bool) -> Self {
        self.respect_task_dates = respect;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_status_date(mut self, date: DateTime<Utc>) -> Self {
        self.status_date = Some(date);
        self
    }

    pub fn with_max_task_hours(mut self, hours: i64) -> Self {
        self.max_task_hours = hours;
        self
    }
}

/// Cooperative cancellation signal shared between a caller and a running
/// calculation or cascade.
///
/// Every clone shares the same state. Running operations call
/// [`check`](Self::check) once per topological or cascade level; the number
/// of checks made so far is available from [`checks`](Self::checks).
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
    checks: Arc<AtomicU64>,
    trip_after: Option<u64>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that cancels itself once `checks` checks have passed.
    #[cfg(test)]
    pub(crate) fn tripping_after(checks: u64) -> Self {
        Self {
            trip_after: Some(checks),
            ..Self::default()
        }
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Checks made against this flag (and its clones) so far.
    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        let seen = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        if self.trip_after.is_some_and(|limit| seen > limit) {
            self.cancel();
        }
        if self.is_cancelled() {
            Err(SchedulingError::Cancelled)
        } else {
            Ok(())
        }
    }
}
