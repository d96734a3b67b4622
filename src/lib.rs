//! Scheduling core for Gantt-style project plans.
//!
//! Tasks linked by typed dependencies (FS/SS/FF/SF with lag) are validated
//! as a DAG, scheduled by the Critical Path Method on a working calendar,
//! re-cascaded when a task is moved, and kept consistent under concurrent
//! edits by optimistic locking with explicit conflict resolution.
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`models`] | `Task`, `Dependency`, calendar, schedule and conflict types |
//! | [`validation`] | Dependency admission, cycle detection, topological levels |
//! | [`scheduler`] | CPM forward/backward pass, slack, critical path, metrics |
//! | [`cascade`] | Push-only rescheduling after a move, with atomic undo |
//! | [`conflict`] | Version-conflict detection, merge rules, resolution |
//! | [`store`] | Repository traits and an in-memory implementation |
//! | [`audit`] | Audit records and sinks |
//! | [`config`] | Engine-wide defaults |
//! | [`service`] | Facade tying the above to a repository |
//!
//! # Example
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use gantt_schedule::models::{Dependency, Task, WorkingHoursConfig};
//! use gantt_schedule::scheduler::{CriticalPathScheduler, SchedulingOptions};
//!
//! let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();
//! let tasks = vec![
//!     Task::new("design", day(8), day(9)),
//!     Task::new("build", day(8), day(10)),
//! ];
//! let deps = vec![Dependency::finish_to_start("design", "build")];
//!
//! let calendar = WorkingHoursConfig::continuous().build().unwrap();
//! let result = CriticalPathScheduler::new(calendar)
//!     .calculate(&tasks, &deps, &SchedulingOptions::default())
//!     .unwrap();
//!
//! assert_eq!(result.task("build").unwrap().earliest_start, day(9));
//! let path: Vec<&str> = result.critical_path.iter().map(|s| s.task_id.as_str()).collect();
//! assert_eq!(path, ["design", "build"]);
//! ```
//!
//! # References
//!
//! - Kelley & Walker (1959), "Critical-Path Planning and Scheduling"
//! - PMI (2021), "PMBOK Guide", 7th ed., schedule network analysis

pub mod audit;
pub mod cascade;
pub mod config;
pub mod conflict;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod validation;

pub use error::{ConflictError, Result, SchedulingError};
pub use service::SchedulingService;
