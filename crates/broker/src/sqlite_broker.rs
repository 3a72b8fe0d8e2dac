//! Broker queue on sqlite, for deployments where producers, workers and
//! the beat run as separate processes sharing one database file.
//!
//! One row per queued envelope; an in-flight delivery is a row with a live
//! lease. Expired leases are reclaimed implicitly: the dequeue predicate
//! treats them as ready again, and the row's original sequence number puts
//! a reclaimed envelope ahead of newer work.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use conveyor_core::models::{TaskEnvelope, TaskId};
use conveyor_core::traits::Broker;
use conveyor_core::{ConveyorError, Result};

use crate::sqlite::connect;

pub struct SqliteBroker {
    pool: SqlitePool,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(connect(url).await?))
    }
}

/// Queue-side database failures are transient: callers back off and the
/// envelope stays where it was.
fn queue_unavailable(e: sqlx::Error) -> ConveyorError {
    ConveyorError::QueueUnavailable(e.to_string())
}

fn lease_expired(task_id: TaskId, worker_id: &str) -> ConveyorError {
    ConveyorError::LeaseExpired {
        task_id,
        worker_id: worker_id.to_string(),
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        // Re-enqueueing a known id is a crash-recovery duplicate, same as
        // the memory backend.
        sqlx::query(
            "INSERT OR IGNORE INTO task_queue (task_id, queue, eta_ms, envelope)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(envelope.id.to_string())
        .bind(&envelope.queue)
        .bind(envelope.eta.map_or(0, |eta| eta.timestamp_millis()))
        .bind(envelope.to_bytes()?)
        .execute(&self.pool)
        .await
        .map_err(queue_unavailable)?;
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<TaskEnvelope>> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_ms = now_ms.saturating_add(lease_duration.as_millis() as i64);
        // Claim and return in a single statement so concurrent consumers of
        // the same file never receive the same envelope.
        let row = sqlx::query(
            "UPDATE task_queue
             SET lease_worker = ?1, lease_expires_ms = ?2
             WHERE seq = (
                 SELECT seq FROM task_queue
                 WHERE queue = ?3
                   AND eta_ms <= ?4
                   AND (lease_worker IS NULL OR lease_expires_ms <= ?4)
                 ORDER BY seq
                 LIMIT 1
             )
             RETURNING envelope",
        )
        .bind(worker_id)
        .bind(expires_ms)
        .bind(queue)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_unavailable)?;
        row.map(|row| {
            let bytes: Vec<u8> = row.try_get("envelope").map_err(queue_unavailable)?;
            TaskEnvelope::from_bytes(&bytes)
        })
        .transpose()
    }

    async fn acknowledge(&self, task_id: TaskId, worker_id: &str) -> Result<()> {
        let done = sqlx::query(
            "DELETE FROM task_queue
             WHERE task_id = ?1 AND lease_worker = ?2 AND lease_expires_ms > ?3",
        )
        .bind(task_id.to_string())
        .bind(worker_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(queue_unavailable)?;
        if done.rows_affected() == 0 {
            return Err(lease_expired(task_id, worker_id));
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        task_id: TaskId,
        worker_id: &str,
        extension: Duration,
    ) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_ms = now_ms.saturating_add(extension.as_millis() as i64);
        let done = sqlx::query(
            "UPDATE task_queue SET lease_expires_ms = ?1
             WHERE task_id = ?2 AND lease_worker = ?3 AND lease_expires_ms > ?4",
        )
        .bind(expires_ms)
        .bind(task_id.to_string())
        .bind(worker_id)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(queue_unavailable)?;
        if done.rows_affected() == 0 {
            return Err(lease_expired(task_id, worker_id));
        }
        Ok(())
    }

    async fn release_lease(&self, task_id: TaskId, worker_id: &str) -> Result<()> {
        // Clearing the lease keeps the original seq, so the envelope goes
        // back ahead of anything enqueued since.
        let done = sqlx::query(
            "UPDATE task_queue SET lease_worker = NULL, lease_expires_ms = NULL
             WHERE task_id = ?1 AND lease_worker = ?2",
        )
        .bind(task_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(queue_unavailable)?;
        if done.rows_affected() == 0 {
            return Err(lease_expired(task_id, worker_id));
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM task_queue
             WHERE queue = ?1 AND (lease_worker IS NULL OR lease_expires_ms <= ?2)",
        )
        .bind(queue)
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(queue_unavailable)?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    const LEASE: Duration = Duration::from_secs(60);

    async fn open(dir: &TempDir) -> SqliteBroker {
        let url = format!("sqlite://{}", dir.path().join("conveyor.db").display());
        SqliteBroker::connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn fifo_order_survives_a_reopen() {
        let dir = TempDir::new().unwrap();
        let first = TaskEnvelope::new("tasks.a", "default");
        let second = TaskEnvelope::new("tasks.b", "default");
        {
            let broker = open(&dir).await;
            broker.enqueue(first.clone()).await.unwrap();
            broker.enqueue(second.clone()).await.unwrap();
        }

        let broker = open(&dir).await;
        let got = broker
            .dequeue("default", "w-1", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, first.id);
        assert_eq!(got.task_name, "tasks.a");
        let got = broker
            .dequeue("default", "w-1", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, second.id);
    }

    #[tokio::test]
    async fn two_connections_share_one_queue() {
        // The beat process enqueues, a separate worker process dequeues.
        let dir = TempDir::new().unwrap();
        let producer = open(&dir).await;
        let consumer = open(&dir).await;

        let env = TaskEnvelope::new("tasks.a", "default");
        producer.enqueue(env.clone()).await.unwrap();

        let got = consumer
            .dequeue("default", "w-1", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, env.id);
        consumer.acknowledge(env.id, "w-1").await.unwrap();
        assert_eq!(producer.queue_depth("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn leased_envelope_is_invisible_until_expiry() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let env = TaskEnvelope::new("tasks.a", "default");
        broker.enqueue(env.clone()).await.unwrap();

        let short = Duration::from_millis(20);
        broker
            .dequeue("default", "w-1", short)
            .await
            .unwrap()
            .unwrap();
        assert!(broker
            .dequeue("default", "w-2", LEASE)
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let reclaimed = broker
            .dequeue("default", "w-2", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, env.id);
        // The original holder lost its claim with the lease.
        let err = broker.acknowledge(env.id, "w-1").await.unwrap_err();
        assert!(matches!(err, ConveyorError::LeaseExpired { .. }));
        broker.acknowledge(env.id, "w-2").await.unwrap();
    }

    #[tokio::test]
    async fn eta_defers_visibility() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let later = TaskEnvelope::new("tasks.later", "default")
            .with_eta(Utc::now() + ChronoDuration::hours(1));
        let now = TaskEnvelope::new("tasks.now", "default");
        broker.enqueue(later.clone()).await.unwrap();
        broker.enqueue(now.clone()).await.unwrap();

        let got = broker
            .dequeue("default", "w-1", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, now.id);
        assert!(broker
            .dequeue("default", "w-1", LEASE)
            .await
            .unwrap()
            .is_none());
        // The deferred envelope still counts toward the backlog.
        assert_eq!(broker.queue_depth("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let env = TaskEnvelope::new("tasks.a", "default");
        broker.enqueue(env.clone()).await.unwrap();
        broker.enqueue(env.clone()).await.unwrap();
        assert_eq!(broker.queue_depth("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn released_envelope_returns_ahead_of_newer_work() {
        let dir = TempDir::new().unwrap();
        let broker = open(&dir).await;
        let first = TaskEnvelope::new("tasks.a", "default");
        broker.enqueue(first.clone()).await.unwrap();

        broker
            .dequeue("default", "w-1", LEASE)
            .await
            .unwrap()
            .unwrap();
        let second = TaskEnvelope::new("tasks.b", "default");
        broker.enqueue(second.clone()).await.unwrap();
        broker.release_lease(first.id, "w-1").await.unwrap();

        let got = broker
            .dequeue("default", "w-2", LEASE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, first.id);
    }
}
