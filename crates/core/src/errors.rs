use std::time::Duration;

use thiserror::Error;

use crate::models::{TaskId, TaskStatus};

/// Error taxonomy for the whole system.
///
/// Transient infrastructure errors (`QueueUnavailable`, `StoreUnavailable`)
/// are retried locally with backoff and never surfaced as task failures.
/// Handler-originated errors are recorded on the task result, never
/// swallowed.
#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("broker unavailable: {0}")]
    QueueUnavailable(String),

    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("lease expired for task {task_id} held by worker {worker_id}")]
    LeaseExpired { task_id: TaskId, worker_id: String },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("duplicate handler registered for task: {0}")]
    DuplicateHandler(String),

    #[error("task execution exceeded timeout of {0:?}")]
    TaskTimeout(Duration),

    #[error("handler error: {0}")]
    HandlerError(String),

    #[error("task {0} was revoked")]
    Revoked(TaskId),

    #[error("no result record for task {0}")]
    ResultNotFound(TaskId),

    #[error("invalid status transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid cron expression: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("lost scheduler leadership")]
    LeadershipLost,

    #[error("timed out waiting for result of task {0}")]
    WaitTimedOut(TaskId),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ConveyorError {
    /// Whether the error is a transient infrastructure failure that the
    /// caller should retry with backoff instead of recording as a task
    /// failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConveyorError::QueueUnavailable(_) | ConveyorError::StoreUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConveyorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_classified() {
        assert!(ConveyorError::QueueUnavailable("down".into()).is_transient());
        assert!(ConveyorError::StoreUnavailable("down".into()).is_transient());
        assert!(!ConveyorError::UnknownTask("nope".into()).is_transient());
        assert!(!ConveyorError::HandlerError("boom".into()).is_transient());
    }
}
