//! In-process event store and leader lock for embedded deployments and
//! tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use conveyor_core::models::{ResultFilter, TaskEnvelope, TaskError, TaskId, TaskResult};
use conveyor_core::traits::{EventStore, LeaderLock};
use conveyor_core::{ConveyorError, Result};

/// Event store backed by a hash map. Single mutex, so writes are trivially
/// read-after-write consistent.
#[derive(Default)]
pub struct MemoryEventStore {
    records: Mutex<HashMap<TaskId, TaskResult>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create_pending(&self, envelope: &TaskEnvelope) -> Result<()> {
        let mut records = self.records.lock().await;
        records
            .entry(envelope.id)
            .or_insert_with(|| TaskResult::pending(envelope));
        Ok(())
    }

    async fn mark_started(&self, envelope: &TaskEnvelope, worker_id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .entry(envelope.id)
            .or_insert_with(|| TaskResult::pending(envelope));
        record.start(worker_id, Utc::now())
    }

    async fn complete(&self, task_id: TaskId, worker_id: &str, value: Value) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&task_id)
            .ok_or(ConveyorError::ResultNotFound(task_id))?;
        record.succeed(worker_id, value, Utc::now())
    }

    async fn fail(&self, task_id: TaskId, worker_id: &str, error: TaskError) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&task_id)
            .ok_or(ConveyorError::ResultNotFound(task_id))?;
        record.fail(worker_id, error, Utc::now())
    }

    async fn mark_retrying(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: TaskError,
        retried_as: TaskId,
    ) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(&task_id)
            .ok_or(ConveyorError::ResultNotFound(task_id))?;
        record.retry(worker_id, error, retried_as)
    }

    async fn revoke(&self, task_id: TaskId) -> Result<bool> {
        let mut records = self.records.lock().await;
        Ok(records
            .get_mut(&task_id)
            .map(|record| record.revoke(Utc::now()))
            .unwrap_or(false))
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskResult>> {
        let records = self.records.lock().await;
        Ok(records.get(&task_id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TaskResult>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| r.idempotency_key.as_deref() == Some(key))
            .min_by_key(|r| r.enqueued_at)
            .cloned())
    }

    async fn query(&self, filter: &ResultFilter) -> Result<Vec<TaskResult>> {
        let records = self.records.lock().await;
        let mut matched: Vec<TaskResult> = records
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.queue.as_deref().map_or(true, |q| r.queue == q))
            .filter(|r| {
                filter
                    .task_name
                    .as_deref()
                    .map_or(true, |t| r.task_name == t)
            })
            .filter(|r| filter.since.map_or(true, |t| r.enqueued_at >= t))
            .filter(|r| filter.until.map_or(true, |t| r.enqueued_at <= t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }
}

struct LockHolder {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Leader lock for embedded single-process deployments. The lease still
/// expires, so the semantics match the sqlite variant exactly.
#[derive(Default)]
pub struct MemoryLeaderLock {
    holder: Mutex<Option<LockHolder>>,
}

impl MemoryLeaderLock {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expiry(ttl: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 2))
}

#[async_trait]
impl LeaderLock for MemoryLeaderLock {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let mut slot = self.holder.lock().await;
        let now = Utc::now();
        let free = match slot.as_ref() {
            None => true,
            Some(current) => current.holder == holder || current.expires_at <= now,
        };
        if free {
            *slot = Some(LockHolder {
                holder: holder.to_string(),
                expires_at: expiry(ttl, now),
            });
        }
        Ok(free)
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let mut slot = self.holder.lock().await;
        let now = Utc::now();
        match slot.as_mut() {
            Some(current) if current.holder == holder && current.expires_at > now => {
                current.expires_at = expiry(ttl, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, holder: &str) -> Result<()> {
        let mut slot = self.holder.lock().await;
        if slot.as_ref().map(|c| c.holder == holder).unwrap_or(false) {
            *slot = None;
        }
        Ok(())
    }
}
