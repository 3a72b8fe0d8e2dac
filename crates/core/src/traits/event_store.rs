use async_trait::async_trait;
use serde_json::Value;

use crate::errors::Result;
use crate::models::{ResultFilter, TaskEnvelope, TaskError, TaskId, TaskResult, TaskStatus};

/// Durable, queryable record of every task generation's lifecycle and
/// outcome. Writes are read-after-write consistent per task id: a worker's
/// own subsequent read observes its preceding write.
///
/// All state transitions go through [`TaskResult`]'s transition methods, so
/// every backend enforces the same monotonic state machine and the same
/// idempotent terminal writes.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Record a fresh PENDING result for a newly produced envelope.
    /// Idempotent: re-creating an existing record is a no-op.
    async fn create_pending(&self, envelope: &TaskEnvelope) -> Result<()>;

    /// PENDING -> STARTED. Takes the whole envelope so a record missing
    /// after a partial crash (enqueued but never registered) is created on
    /// the spot instead of failing the redelivery.
    async fn mark_started(&self, envelope: &TaskEnvelope, worker_id: &str) -> Result<()>;

    /// STARTED -> SUCCESS with the handler's return value.
    async fn complete(&self, task_id: TaskId, worker_id: &str, value: Value) -> Result<()>;

    /// STARTED -> FAILURE (terminal) with the captured error.
    async fn fail(&self, task_id: TaskId, worker_id: &str, error: TaskError) -> Result<()>;

    /// STARTED -> RETRY, closing this generation and linking the successor
    /// envelope that re-enters PENDING.
    async fn mark_retrying(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: TaskError,
        retried_as: TaskId,
    ) -> Result<()>;

    /// Revoke a task that is still PENDING or STARTED. Returns whether the
    /// record was actually revoked; revoking an already-finished task is a
    /// normal race and reports `false`.
    async fn revoke(&self, task_id: TaskId) -> Result<bool>;

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskResult>>;

    /// Look up a prior submission by caller-supplied idempotency key.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TaskResult>>;

    /// Query results by status, queue, task name and time range.
    async fn query(&self, filter: &ResultFilter) -> Result<Vec<TaskResult>>;

    /// Follow the retry chain from `task_id` to the most recent generation.
    async fn resolve_latest(&self, task_id: TaskId) -> Result<Option<TaskResult>> {
        let Some(mut record) = self.get(task_id).await? else {
            return Ok(None);
        };
        while let Some(next_id) = record.retried_as {
            match self.get(next_id).await? {
                Some(next) => record = next,
                // Successor not visible yet; report the RETRY record.
                None => break,
            }
        }
        Ok(Some(record))
    }

    /// Cooperative-cancellation probe used by workers and task checkpoints.
    async fn is_revoked(&self, task_id: TaskId) -> Result<bool> {
        Ok(self
            .get(task_id)
            .await?
            .map(|r| r.status == TaskStatus::Revoked)
            .unwrap_or(false))
    }
}
