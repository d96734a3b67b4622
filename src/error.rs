//! Crate error type.
//!
//! Validation failures block an operation before anything is mutated;
//! conflicts are normally returned as data and only become an error at the
//! apply boundary, where a stale etag means the write must not happen.

use thiserror::Error;

use crate::models::{CalendarError, ConflictId, ConflictStatus, DetectedConflict, FieldError};
use crate::store::RepositoryError;
use crate::validation::ValidationErrors;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SchedulingError>;

/// Errors surfaced by scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulingError {
    /// Input failed structural validation (cycle, self-dependency, bad dates).
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    /// The CPM passes needed more levels than allowed.
    #[error("calculation did not converge: {iterations} iterations exceed the limit of {max_iterations}")]
    Calculation { iterations: u32, max_iterations: u32 },

    /// A write was based on a stale snapshot.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// The caller raised the cancellation flag.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid working calendar: {0}")]
    Calendar(#[from] CalendarError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("conflict {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: ConflictId,
        from: ConflictStatus,
        to: ConflictStatus,
    },

    #[error(transparent)]
    InvalidField(#[from] FieldError),

    /// A strategy could not produce a value for the conflict.
    #[error("cannot resolve {id}: {message}")]
    Resolution { id: ConflictId, message: String },
}

/// Stale-snapshot write, carrying every conflict found.
#[derive(Debug, Clone, Error)]
#[error("{} conflicting write(s) detected", .conflicts.len())]
pub struct ConflictError {
    pub conflicts: Vec<DetectedConflict>,
}

impl ConflictError {
    pub fn new(conflicts: Vec<DetectedConflict>) -> Self {
        Self { conflicts }
    }
}
