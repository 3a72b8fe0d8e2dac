use std::time::Duration;

use async_trait::async_trait;

use crate::errors::Result;
use crate::models::{TaskEnvelope, TaskId};

/// The durable, ordered hand-off channel between producers and workers.
///
/// Delivery is at-least-once: an envelope that was dequeued but never
/// acknowledged becomes reclaimable once its lease expires. FIFO per queue
/// is best-effort only, since lease reclaim can reorder redelivered
/// envelopes. An envelope is never silently dropped barring backing-store
/// failure.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue an envelope. Fails with `QueueUnavailable` when the backing
    /// store is unreachable; the caller retries with backoff.
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()>;

    /// Pop the oldest ready envelope (eta elapsed, not currently leased)
    /// and atomically assign a lease to `worker_id`. Returns `None` when
    /// nothing is ready.
    async fn dequeue(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<TaskEnvelope>>;

    /// Permanently remove an envelope after processing. Fails with
    /// `LeaseExpired` when the lease was reclaimed by another worker; the
    /// caller must not also commit a result.
    async fn acknowledge(&self, task_id: TaskId, worker_id: &str) -> Result<()>;

    /// Push the lease expiry out for a long-running task.
    async fn extend_lease(
        &self,
        task_id: TaskId,
        worker_id: &str,
        extension: Duration,
    ) -> Result<()>;

    /// Return a leased envelope to the queue without acknowledging it
    /// (graceful shutdown of a worker mid-task).
    async fn release_lease(&self, task_id: TaskId, worker_id: &str) -> Result<()>;

    /// Number of envelopes waiting in a queue (ready or delayed), excluding
    /// leased ones.
    async fn queue_depth(&self, queue: &str) -> Result<usize>;
}
