//! Optimistic-locking conflict detection and resolution.
//!
//! Concurrent edits are not blocked. Every task and dependency carries a
//! `version`; a write names the version it read, and a mismatch becomes a
//! [`DetectedConflict`](crate::models::DetectedConflict) that a user (or a
//! policy) settles with one of four strategies.
//!
//! # Flow
//!
//! ```text
//! writes + read set ──► ConflictDetector::detect ──► Vec<DetectedConflict>
//!                                                        │ register
//!                                                        ▼
//!        AppliedChange[] ◄── ConflictResolver::resolve_conflict / _bulk_conflicts
//! ```
//!
//! # Modules
//!
//! - **`detector`**: version checks and structural re-validation
//! - **`merge`**: per-field rules for the MERGE strategy
//! - **`resolver`**: strategies, registry, lifecycle

mod detector;
mod merge;
mod resolver;

pub use detector::{ConflictContext, ConflictDetector, PendingWrite};
pub use merge::{
    AssigneeMergeRule, DateMergeRule, MergeError, MergePreference, MergeRules, ProgressMergeRule,
};
pub use resolver::{resolve_values, ConflictResolver, ResolutionOptions};
