use chrono::NaiveDate;
use thiserror::Error;

use crate::models::LedgerStatus;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Registration and check-in refusals, surfaced to the caller verbatim.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    #[error("student is already enrolled in this item")]
    AlreadyEnrolled,
    #[error("item schedule overlaps another active enrollment")]
    ScheduleConflict,
    #[error("item capacity exceeded")]
    CapacityExceeded,
    #[error("student is not eligible for this item")]
    EligibilityMismatch,
    #[error("already checked {0} on this date")]
    AlreadyCheckedIn(&'static str),
    #[error("attendance was changed by another request")]
    StaleAttendance,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0} is not a scheduled date for this item")]
    DateNotScheduled(NaiveDate),

    #[error("ledger status cannot move from {from} to {to}")]
    InvalidTransition { from: LedgerStatus, to: LedgerStatus },

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("task queue error: {0}")]
    Queue(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Dependency failures (storage, queue, deadlines) are worth retrying with
    /// backoff; everything else is terminal for the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Database(_) | LedgerError::Timeout(_) | LedgerError::Queue(_)
        )
    }
}

/// A best-effort step that failed without aborting the surrounding operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFailure {
    pub target: String,
    pub step: &'static str,
    pub error: String,
}

impl PartialFailure {
    pub fn new(target: impl ToString, step: &'static str, error: &LedgerError) -> Self {
        Self {
            target: target.to_string(),
            step,
            error: error.to_string(),
        }
    }
}

impl std::fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.target, self.step, self.error)
    }
}
