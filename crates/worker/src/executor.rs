//! Single-envelope execution.
//!
//! The ordering invariant of the whole system lives here: the result write
//! always lands in the event store before the broker acknowledgement. A
//! crash between the two produces a redelivery, which the idempotent
//! terminal writes absorb; the reverse order could lose a result forever.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{info, warn};

use conveyor_core::config::{BrokerConfig, WorkerConfig};
use conveyor_core::models::{TaskEnvelope, TaskError, TaskStatus};
use conveyor_core::traits::{Broker, EventStore};
use conveyor_core::{ConveyorError, Result, RetryPolicy, TaskContext, TaskRegistry};

/// What became of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler returned a value; SUCCESS recorded.
    Completed,
    /// Retryable failure; a successor generation was enqueued.
    Retried,
    /// Terminal FAILURE recorded.
    Failed,
    /// Task was revoked before or during execution.
    Revoked,
    /// Record already closed by an earlier delivery; nothing to do.
    Skipped,
}

pub struct TaskExecutor {
    broker: Arc<dyn Broker>,
    store: Arc<dyn EventStore>,
    registry: Arc<TaskRegistry>,
    retry_policy: RetryPolicy,
    lease_duration: Duration,
    store_retry_attempts: u32,
    store_retry_delay: Duration,
}

impl TaskExecutor {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn EventStore>,
        registry: Arc<TaskRegistry>,
        retry_policy: RetryPolicy,
        broker_config: &BrokerConfig,
        worker_config: &WorkerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            registry,
            retry_policy,
            lease_duration: broker_config.lease_duration(),
            store_retry_attempts: worker_config.store_retry_attempts.max(1),
            store_retry_delay: worker_config.store_retry_delay(),
        }
    }

    /// Dequeue one envelope from `queue` and run it to an outcome. `None`
    /// when the queue had nothing ready.
    pub async fn poll_once(&self, queue: &str, worker_id: &str) -> Result<Option<Outcome>> {
        let Some(envelope) = self
            .broker
            .dequeue(queue, worker_id, self.lease_duration)
            .await?
        else {
            return Ok(None);
        };
        self.process(envelope, worker_id).await.map(Some)
    }

    pub async fn process(&self, envelope: TaskEnvelope, worker_id: &str) -> Result<Outcome> {
        // A redelivered envelope whose record is already closed must not
        // run again; likewise one revoked while it sat in the queue.
        if let Some(record) = self.store.get(envelope.id).await? {
            if record.status.is_closed() {
                let outcome = if record.status == TaskStatus::Revoked {
                    Outcome::Revoked
                } else {
                    Outcome::Skipped
                };
                self.ack(&envelope, worker_id).await;
                return Ok(outcome);
            }
        }

        // Never execute without a STARTED record: the record is what makes
        // the attempt observable.
        if let Err(e) = self
            .with_retries(|| self.store.mark_started(&envelope, worker_id))
            .await
        {
            return Err(self.give_back(&envelope, worker_id, e).await);
        }

        let (handler, policy) = match self.registry.resolve(&envelope.task_name) {
            Ok(resolved) => resolved,
            Err(ConveyorError::UnknownTask(task_name)) => {
                warn!(task_id = %envelope.id, task_name = %task_name, "no handler registered, failing fast");
                let error = TaskError::unknown_task(&envelope.task_name);
                if let Err(e) = self
                    .with_retries(|| self.store.fail(envelope.id, worker_id, error.clone()))
                    .await
                {
                    return Err(self.give_back(&envelope, worker_id, e).await);
                }
                self.ack(&envelope, worker_id).await;
                return Ok(Outcome::Failed);
            }
            Err(e) => return Err(e),
        };

        if policy.timeout >= self.lease_duration {
            // Long task: push the lease out so it is not reclaimed mid-run.
            if let Err(e) = self
                .broker
                .extend_lease(envelope.id, worker_id, policy.timeout)
                .await
            {
                warn!(task_id = %envelope.id, error = %e, "could not extend lease");
            }
        }

        info!(
            task_id = %envelope.id,
            task_name = %envelope.task_name,
            queue = %envelope.queue,
            worker_id,
            retry_count = envelope.retry_count,
            "executing task"
        );

        let ctx = TaskContext::new(envelope.clone(), Arc::clone(&self.store));
        match timeout(policy.timeout, handler.run(&ctx)).await {
            Ok(Ok(value)) => {
                match self
                    .with_retries(|| self.store.complete(envelope.id, worker_id, value.clone()))
                    .await
                {
                    Ok(()) => {
                        self.ack(&envelope, worker_id).await;
                        Ok(Outcome::Completed)
                    }
                    // Revoked mid-run by a handler that never checkpoints:
                    // the revocation wins, the value is dropped.
                    Err(ConveyorError::InvalidTransition { .. })
                        if self.store.is_revoked(envelope.id).await.unwrap_or(false) =>
                    {
                        self.ack(&envelope, worker_id).await;
                        Ok(Outcome::Revoked)
                    }
                    Err(e) => Err(self.give_back(&envelope, worker_id, e).await),
                }
            }
            Ok(Err(ConveyorError::Revoked(_))) => {
                // Handler observed the revocation at a checkpoint; the
                // record is already REVOKED.
                self.ack(&envelope, worker_id).await;
                Ok(Outcome::Revoked)
            }
            Ok(Err(err)) => {
                self.handle_failure(&envelope, worker_id, TaskError::handler(err.to_string()))
                    .await
            }
            Err(_elapsed) => {
                self.handle_failure(&envelope, worker_id, TaskError::timeout(policy.timeout))
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        envelope: &TaskEnvelope,
        worker_id: &str,
        error: TaskError,
    ) -> Result<Outcome> {
        // Same race as the success path: revoked mid-run, then the handler
        // failed. The record is already REVOKED and the lineage stops with
        // it; a successor generation would escape the revocation.
        if self.store.is_revoked(envelope.id).await.unwrap_or(false) {
            self.ack(envelope, worker_id).await;
            return Ok(Outcome::Revoked);
        }
        if error.retryable && envelope.retries_remaining() {
            let eta = self.retry_policy.next_eta(envelope.retry_count, Utc::now());
            let next = envelope.next_generation(Some(eta));
            // Successor first: a crash between these steps duplicates work
            // instead of losing it.
            if let Err(e) = self.with_retries(|| self.store.create_pending(&next)).await {
                return Err(self.give_back(envelope, worker_id, e).await);
            }
            if let Err(e) = self.with_retries(|| self.broker.enqueue(next.clone())).await {
                return Err(self.give_back(envelope, worker_id, e).await);
            }
            if let Err(e) = self
                .with_retries(|| {
                    self.store
                        .mark_retrying(envelope.id, worker_id, error.clone(), next.id)
                })
                .await
            {
                return Err(self.give_back(envelope, worker_id, e).await);
            }
            self.ack(envelope, worker_id).await;
            info!(
                task_id = %envelope.id,
                next_id = %next.id,
                retry_count = next.retry_count,
                max_retries = next.max_retries,
                eta = %eta,
                "task failed, retry scheduled"
            );
            Ok(Outcome::Retried)
        } else {
            if let Err(e) = self
                .with_retries(|| self.store.fail(envelope.id, worker_id, error.clone()))
                .await
            {
                return Err(self.give_back(envelope, worker_id, e).await);
            }
            self.ack(envelope, worker_id).await;
            warn!(
                task_id = %envelope.id,
                task_name = %envelope.task_name,
                error = %error.message,
                "task failed terminally"
            );
            Ok(Outcome::Failed)
        }
    }

    /// Acknowledge after the result write. A reclaimed lease here is not a
    /// fault: the result is durable and the duplicate delivery will be
    /// absorbed by the closed record.
    async fn ack(&self, envelope: &TaskEnvelope, worker_id: &str) {
        if let Err(e) = self.broker.acknowledge(envelope.id, worker_id).await {
            warn!(
                task_id = %envelope.id,
                worker_id,
                error = %e,
                "acknowledge failed after result write, expecting redelivery"
            );
        }
    }

    /// Give the envelope back for redelivery and surface the error.
    async fn give_back(
        &self,
        envelope: &TaskEnvelope,
        worker_id: &str,
        err: ConveyorError,
    ) -> ConveyorError {
        warn!(
            task_id = %envelope.id,
            worker_id,
            error = %err,
            "backend unavailable, returning envelope for redelivery"
        );
        let _ = self.broker.release_lease(envelope.id, worker_id).await;
        err
    }

    /// Bounded local retries for transient backend failures. Anything
    /// non-transient is returned immediately.
    async fn with_retries<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.store_retry_attempts => {
                    attempt += 1;
                    warn!(attempt, error = %e, "transient backend failure, retrying");
                    tokio::time::sleep(self.store_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
