use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use conveyor_core::models::{TaskEnvelope, TaskId, TaskResult};
use conveyor_core::traits::{Broker, EventStore};
use conveyor_core::{ConveyorError, Result, TaskRegistry};

/// Per-submission overrides. Everything unset falls back to the registered
/// task policy.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub queue: Option<String>,
    /// Absolute earliest execution time.
    pub eta: Option<DateTime<Utc>>,
    /// Relative delay; ignored when `eta` is set.
    pub countdown: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Caller-supplied key: a second submission with the same key returns
    /// the original task id instead of enqueueing again.
    pub idempotency_key: Option<String>,
}

impl SubmitOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Dispatch client. Cheap to clone; all state lives behind the shared
/// broker and store handles.
#[derive(Clone)]
pub struct Client {
    broker: Arc<dyn Broker>,
    store: Arc<dyn EventStore>,
    registry: Arc<TaskRegistry>,
}

impl Client {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn EventStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            broker,
            store,
            registry,
        }
    }

    pub async fn submit(
        &self,
        task_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<TaskId> {
        self.submit_with(task_name, args, kwargs, SubmitOptions::default())
            .await
    }

    /// Validate, record and enqueue one task. Unknown task names fail here,
    /// at the producer, never on a worker.
    pub async fn submit_with(
        &self,
        task_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        let policy = self.registry.policy(task_name)?;

        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                debug!(
                    task_id = %existing.task_id,
                    idempotency_key = %key,
                    "duplicate submission, returning original task id"
                );
                return Ok(existing.task_id);
            }
        }

        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| policy.queue.clone());
        let max_retries = options.max_retries.unwrap_or(policy.max_retries);
        let eta = options.eta.or_else(|| {
            options.countdown.map(|countdown| {
                Utc::now()
                    + chrono::Duration::from_std(countdown)
                        .unwrap_or_else(|_| chrono::Duration::seconds(0))
            })
        });

        let mut envelope = TaskEnvelope::new(task_name, queue)
            .with_args(args)
            .with_kwargs(kwargs)
            .with_max_retries(max_retries);
        if let Some(eta) = eta {
            envelope = envelope.with_eta(eta);
        }
        if let Some(key) = options.idempotency_key {
            envelope = envelope.with_idempotency_key(key);
        }

        // The record precedes visibility: an envelope a worker can see must
        // already be queryable.
        self.store.create_pending(&envelope).await?;
        self.broker.enqueue(envelope.clone()).await?;
        info!(
            task_id = %envelope.id,
            task_name = %envelope.task_name,
            queue = %envelope.queue,
            "task submitted"
        );
        Ok(envelope.id)
    }

    /// Latest generation of the task's retry chain, or `None` for an
    /// unknown id.
    pub async fn get_result(&self, task_id: TaskId) -> Result<Option<TaskResult>> {
        self.store.resolve_latest(task_id).await
    }

    /// Poll until the chain reaches a terminal state or `timeout` elapses.
    pub async fn wait(
        &self,
        task_id: TaskId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<TaskResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.store.resolve_latest(task_id).await? {
                if record.status.is_terminal() {
                    return Ok(record);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConveyorError::WaitTimedOut(task_id));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Revoke the latest generation of the chain. `false` when the task
    /// already finished, which is a normal race.
    pub async fn revoke(&self, task_id: TaskId) -> Result<bool> {
        let target = match self.store.resolve_latest(task_id).await? {
            Some(record) => record.task_id,
            None => return Ok(false),
        };
        let revoked = self.store.revoke(target).await?;
        if revoked {
            info!(task_id = %task_id, target = %target, "task revoked");
        }
        Ok(revoked)
    }

    pub async fn queue_depth(&self, queue: &str) -> Result<usize> {
        self.broker.queue_depth(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use conveyor_broker::{MemoryBroker, MemoryEventStore};
    use conveyor_core::models::{TaskError, TaskStatus};
    use conveyor_core::{TaskContext, TaskHandler, TaskPolicy};

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn run(&self, _ctx: &TaskContext) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn client() -> (Arc<MemoryBroker>, Arc<MemoryEventStore>, Client) {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryEventStore::new());
        let mut registry = TaskRegistry::new();
        registry
            .register(
                "tasks.ping",
                Arc::new(NoopHandler),
                TaskPolicy::default().with_max_retries(2).with_queue("fast"),
            )
            .unwrap();
        let client = Client::new(broker.clone(), store.clone(), Arc::new(registry));
        (broker, store, client)
    }

    #[tokio::test]
    async fn submit_applies_registered_policy_defaults() {
        let (broker, store, client) = client();
        let task_id = client
            .submit("tasks.ping", vec![json!(1)], Map::new())
            .await
            .unwrap();

        let record = store.get(task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.queue, "fast");
        assert_eq!(record.max_retries, 2);
        assert_eq!(broker.queue_depth("fast").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_task_is_rejected_at_submission() {
        let (broker, _store, client) = client();
        let err = client
            .submit("tasks.ghost", Vec::new(), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::UnknownTask(_)));
        assert_eq!(broker.queue_depth("fast").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn countdown_defers_execution() {
        let (broker, _store, client) = client();
        client
            .submit_with(
                "tasks.ping",
                Vec::new(),
                Map::new(),
                SubmitOptions::default().with_countdown(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        // Queued but not yet visible to a worker.
        assert_eq!(broker.queue_depth("fast").await.unwrap(), 1);
        assert!(broker
            .dequeue("fast", "w-1", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn idempotency_key_deduplicates_submissions() {
        let (broker, _store, client) = client();
        let options = SubmitOptions::default().with_idempotency_key("req-1");

        let first = client
            .submit_with("tasks.ping", Vec::new(), Map::new(), options.clone())
            .await
            .unwrap();
        let second = client
            .submit_with("tasks.ping", Vec::new(), Map::new(), options)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(broker.queue_depth("fast").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn revoke_closes_a_pending_task() {
        let (_broker, _store, client) = client();
        let task_id = client
            .submit("tasks.ping", Vec::new(), Map::new())
            .await
            .unwrap();

        assert!(client.revoke(task_id).await.unwrap());
        let record = client.get_result(task_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Revoked);
        // A second revoke is a lost race, not an error.
        assert!(!client.revoke(task_id).await.unwrap());
        // Unknown ids report false.
        assert!(!client.revoke(TaskId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn get_result_follows_the_retry_chain() {
        let (_broker, store, client) = client();
        let task_id = client
            .submit("tasks.ping", Vec::new(), Map::new())
            .await
            .unwrap();

        // Simulate a worker retrying and completing the successor.
        let gen0 = store.get(task_id).await.unwrap().unwrap();
        let mut first_env = TaskEnvelope::new("tasks.ping", "fast").with_max_retries(2);
        first_env.id = gen0.task_id;
        first_env.root_id = gen0.root_id;
        let gen1 = first_env.next_generation(None);

        store.mark_started(&first_env, "w-1").await.unwrap();
        store.create_pending(&gen1).await.unwrap();
        store
            .mark_retrying(gen0.task_id, "w-1", TaskError::handler("boom"), gen1.id)
            .await
            .unwrap();
        store.mark_started(&gen1, "w-1").await.unwrap();
        store
            .complete(gen1.id, "w-1", json!("done"))
            .await
            .unwrap();

        let latest = client.get_result(task_id).await.unwrap().unwrap();
        assert_eq!(latest.task_id, gen1.id);
        assert_eq!(latest.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn wait_returns_once_the_chain_terminates() {
        let (_broker, store, client) = client();
        let task_id = client
            .submit("tasks.ping", Vec::new(), Map::new())
            .await
            .unwrap();

        let store_for_worker = store.clone();
        let finisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let record = store_for_worker.get(task_id).await.unwrap().unwrap();
            let mut envelope = TaskEnvelope::new("tasks.ping", "fast");
            envelope.id = record.task_id;
            envelope.root_id = record.root_id;
            store_for_worker
                .mark_started(&envelope, "w-1")
                .await
                .unwrap();
            store_for_worker
                .complete(task_id, "w-1", json!(5))
                .await
                .unwrap();
        });

        let result = client
            .wait(task_id, Duration::from_secs(2), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.result, Some(json!(5)));
        finisher.await.unwrap();
    }

    #[tokio::test]
    async fn wait_times_out_on_a_task_that_never_finishes() {
        let (_broker, _store, client) = client();
        let task_id = client
            .submit("tasks.ping", Vec::new(), Map::new())
            .await
            .unwrap();

        let err = client
            .wait(
                task_id,
                Duration::from_millis(50),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::WaitTimedOut(id) if id == task_id));
    }
}
