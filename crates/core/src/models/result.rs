use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::envelope::{TaskEnvelope, TaskId};
use crate::errors::{ConveyorError, Result};

/// Lifecycle status of a single task generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "STARTED")]
    Started,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(rename = "RETRY")]
    Retry,
    #[serde(rename = "REVOKED")]
    Revoked,
}

impl TaskStatus {
    /// Terminal states of the lifecycle state machine. `Retry` is not
    /// terminal for the lineage: it closes this generation's record and the
    /// chain continues in a new envelope.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }

    /// No further transitions are permitted out of this state for this
    /// record.
    pub fn is_closed(self) -> bool {
        self.is_terminal() || self == TaskStatus::Retry
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Started)
                | (Pending, Revoked)
                | (Started, Success)
                | (Started, Failure)
                | (Started, Retry)
                | (Started, Revoked)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Revoked => "REVOKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "STARTED" => Some(TaskStatus::Started),
            "SUCCESS" => Some(TaskStatus::Success),
            "FAILURE" => Some(TaskStatus::Failure),
            "RETRY" => Some(TaskStatus::Retry),
            "REVOKED" => Some(TaskStatus::Revoked),
            _ => None,
        }
    }
}

/// Classification of a recorded execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskErrorKind {
    /// Business-logic error raised by the handler. Retryable.
    Handler,
    /// Handler exceeded its execution budget. Retryable.
    Timeout,
    /// No handler registered for the task name. Fatal, never retried.
    UnknownTask,
    /// Task was cancelled cooperatively.
    Revoked,
}

/// Structured error captured on a task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Handler,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn timeout(budget: Duration) -> Self {
        Self {
            kind: TaskErrorKind::Timeout,
            message: format!("task execution exceeded timeout of {budget:?}"),
            retryable: true,
        }
    }

    pub fn unknown_task(task_name: &str) -> Self {
        Self {
            kind: TaskErrorKind::UnknownTask,
            message: format!("no handler registered for task {task_name}"),
            retryable: false,
        }
    }

    pub fn revoked() -> Self {
        Self {
            kind: TaskErrorKind::Revoked,
            message: "task was revoked".to_string(),
            retryable: false,
        }
    }
}

/// Durable record of one task generation's lifecycle and outcome.
///
/// The event store keeps one record per generation; a retried generation is
/// closed with status `Retry` and `retried_as` pointing at its successor,
/// so the full chain remains available for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub root_id: TaskId,
    pub parent_id: Option<TaskId>,
    pub task_name: String,
    pub queue: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    /// Next generation in the retry chain, set when status is `Retry`.
    pub retried_as: Option<TaskId>,
    pub worker_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    /// Fresh PENDING record for a newly produced envelope.
    pub fn pending(envelope: &TaskEnvelope) -> Self {
        Self {
            task_id: envelope.id,
            root_id: envelope.root_id,
            parent_id: envelope.parent_id,
            task_name: envelope.task_name.clone(),
            queue: envelope.queue.clone(),
            status: TaskStatus::Pending,
            retry_count: envelope.retry_count,
            max_retries: envelope.max_retries,
            result: None,
            error: None,
            retried_as: None,
            worker_id: None,
            idempotency_key: envelope.idempotency_key.clone(),
            enqueued_at: envelope.enqueued_at,
            started_at: None,
            finished_at: None,
        }
    }

    fn check_transition(&self, to: TaskStatus) -> Result<()> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(ConveyorError::InvalidTransition {
                task_id: self.task_id,
                from: self.status,
                to,
            })
        }
    }

    /// PENDING -> STARTED. Re-applying STARTED is a no-op so that a
    /// redelivered envelope does not trip over its own earlier attempt.
    pub fn start(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status == TaskStatus::Started {
            return Ok(());
        }
        self.check_transition(TaskStatus::Started)?;
        self.status = TaskStatus::Started;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
        Ok(())
    }

    /// STARTED -> SUCCESS. Idempotent: a second SUCCESS write for the same
    /// task id is absorbed without producing a divergent record.
    pub fn succeed(&mut self, worker_id: &str, value: Value, now: DateTime<Utc>) -> Result<()> {
        if self.status == TaskStatus::Success {
            return Ok(());
        }
        self.check_transition(TaskStatus::Success)?;
        self.status = TaskStatus::Success;
        self.worker_id = Some(worker_id.to_string());
        self.result = Some(value);
        self.finished_at = Some(now);
        Ok(())
    }

    /// STARTED -> FAILURE (terminal). Idempotent like [`succeed`].
    ///
    /// [`succeed`]: TaskResult::succeed
    pub fn fail(&mut self, worker_id: &str, error: TaskError, now: DateTime<Utc>) -> Result<()> {
        if self.status == TaskStatus::Failure {
            return Ok(());
        }
        self.check_transition(TaskStatus::Failure)?;
        self.status = TaskStatus::Failure;
        self.worker_id = Some(worker_id.to_string());
        self.error = Some(error);
        self.finished_at = Some(now);
        Ok(())
    }

    /// STARTED -> RETRY, closing this generation and linking its successor.
    /// `finished_at` stays unset: the lineage is still in flight.
    pub fn retry(&mut self, worker_id: &str, error: TaskError, retried_as: TaskId) -> Result<()> {
        if self.status == TaskStatus::Retry && self.retried_as == Some(retried_as) {
            return Ok(());
        }
        self.check_transition(TaskStatus::Retry)?;
        self.status = TaskStatus::Retry;
        self.worker_id = Some(worker_id.to_string());
        self.error = Some(error);
        self.retried_as = Some(retried_as);
        Ok(())
    }

    /// PENDING/STARTED -> REVOKED. Returns false (without error) when the
    /// record is already closed, since revocation of a finished task is a
    /// normal race, not a fault.
    pub fn revoke(&mut self, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(TaskStatus::Revoked) {
            return false;
        }
        self.status = TaskStatus::Revoked;
        self.error = Some(TaskError::revoked());
        self.finished_at = Some(now);
        true
    }
}

/// Query filter for the event store, for observability and retry tooling.
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    pub status: Option<TaskStatus>,
    pub queue: Option<String>,
    pub task_name: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl ResultFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_record() -> TaskResult {
        let env = TaskEnvelope::new("tasks.ping", "default");
        let mut record = TaskResult::pending(&env);
        record.start("w-1", Utc::now()).unwrap();
        record
    }

    #[test]
    fn finished_at_set_only_on_terminal_states() {
        let env = TaskEnvelope::new("tasks.ping", "default");
        let mut record = TaskResult::pending(&env);
        assert!(record.finished_at.is_none());

        record.start("w-1", Utc::now()).unwrap();
        assert!(record.finished_at.is_none());

        record
            .succeed("w-1", serde_json::json!("ok"), Utc::now())
            .unwrap();
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut record = started_record();
        record
            .succeed("w-1", serde_json::json!("ok"), Utc::now())
            .unwrap();

        let err = record
            .fail("w-2", TaskError::handler("late"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidTransition { .. }));
        assert_eq!(record.status, TaskStatus::Success);
    }

    #[test]
    fn duplicate_success_is_idempotent() {
        let mut record = started_record();
        record
            .succeed("w-1", serde_json::json!(1), Utc::now())
            .unwrap();
        let first_finished = record.finished_at;

        // Redelivery after a completed write must not diverge the record.
        record
            .succeed("w-2", serde_json::json!(2), Utc::now())
            .unwrap();
        assert_eq!(record.worker_id.as_deref(), Some("w-1"));
        assert_eq!(record.result, Some(serde_json::json!(1)));
        assert_eq!(record.finished_at, first_finished);
    }

    #[test]
    fn started_cannot_regress_to_pending_path() {
        let env = TaskEnvelope::new("tasks.ping", "default");
        let mut record = TaskResult::pending(&env);
        let err = record
            .succeed("w-1", serde_json::json!(1), Utc::now())
            .unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidTransition { .. }));
    }

    #[test]
    fn revoke_applies_only_while_unfinished() {
        let env = TaskEnvelope::new("tasks.ping", "default");
        let mut pending = TaskResult::pending(&env);
        assert!(pending.revoke(Utc::now()));
        assert_eq!(pending.status, TaskStatus::Revoked);
        assert!(pending.finished_at.is_some());

        let mut done = started_record();
        done.succeed("w-1", serde_json::json!(1), Utc::now()).unwrap();
        assert!(!done.revoke(Utc::now()));
        assert_eq!(done.status, TaskStatus::Success);
    }

    #[test]
    fn retry_closes_record_with_successor_link() {
        let mut record = started_record();
        let next = TaskId::new();
        record
            .retry("w-1", TaskError::handler("boom"), next)
            .unwrap();
        assert_eq!(record.status, TaskStatus::Retry);
        assert_eq!(record.retried_as, Some(next));
        assert!(record.status.is_closed());
        assert!(!record.status.is_terminal());
        // finished_at is reserved for terminal states.
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Started,
            TaskStatus::Success,
            TaskStatus::Failure,
            TaskStatus::Retry,
            TaskStatus::Revoked,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("UNKNOWN"), None);
    }
}
