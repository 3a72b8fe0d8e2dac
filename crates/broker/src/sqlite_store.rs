//! Durable event store on sqlite.
//!
//! The full record is stored as a JSON document next to a few indexed
//! columns for filtering. Transitions are read-modify-write under a
//! process-local write lock; all transition rules live in `TaskResult`,
//! so this backend cannot diverge from the in-memory one.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::Mutex;

use conveyor_core::models::{ResultFilter, TaskEnvelope, TaskError, TaskId, TaskResult};
use conveyor_core::traits::EventStore;
use conveyor_core::{ConveyorError, Result};

use crate::sqlite::{connect, store_unavailable};

pub struct SqliteEventStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(connect(url).await?))
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<TaskResult>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT record FROM task_results WHERE task_id = ?1")
                .bind(task_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_unavailable)?;
        row.map(|(record,)| serde_json::from_str(&record).map_err(ConveyorError::from))
            .transpose()
    }

    async fn upsert(&self, record: &TaskResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_results
                (task_id, root_id, status, task_name, queue, idempotency_key,
                 enqueued_at_ms, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                record = excluded.record",
        )
        .bind(record.task_id.to_string())
        .bind(record.root_id.to_string())
        .bind(record.status.as_str())
        .bind(&record.task_name)
        .bind(&record.queue)
        .bind(record.idempotency_key.as_deref())
        .bind(record.enqueued_at.timestamp_millis())
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await
        .map_err(store_unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn create_pending(&self, envelope: &TaskEnvelope) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.load(envelope.id).await?.is_some() {
            return Ok(());
        }
        self.upsert(&TaskResult::pending(envelope)).await
    }

    async fn mark_started(&self, envelope: &TaskEnvelope, worker_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load(envelope.id)
            .await?
            .unwrap_or_else(|| TaskResult::pending(envelope));
        record.start(worker_id, Utc::now())?;
        self.upsert(&record).await
    }

    async fn complete(&self, task_id: TaskId, worker_id: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load(task_id)
            .await?
            .ok_or(ConveyorError::ResultNotFound(task_id))?;
        record.succeed(worker_id, value, Utc::now())?;
        self.upsert(&record).await
    }

    async fn fail(&self, task_id: TaskId, worker_id: &str, error: TaskError) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load(task_id)
            .await?
            .ok_or(ConveyorError::ResultNotFound(task_id))?;
        record.fail(worker_id, error, Utc::now())?;
        self.upsert(&record).await
    }

    async fn mark_retrying(
        &self,
        task_id: TaskId,
        worker_id: &str,
        error: TaskError,
        retried_as: TaskId,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load(task_id)
            .await?
            .ok_or(ConveyorError::ResultNotFound(task_id))?;
        record.retry(worker_id, error, retried_as)?;
        self.upsert(&record).await
    }

    async fn revoke(&self, task_id: TaskId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.load(task_id).await? else {
            return Ok(false);
        };
        if !record.revoke(Utc::now()) {
            return Ok(false);
        }
        self.upsert(&record).await?;
        Ok(true)
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskResult>> {
        self.load(task_id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TaskResult>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT record FROM task_results
             WHERE idempotency_key = ?1
             ORDER BY enqueued_at_ms ASC
             LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_unavailable)?;
        row.map(|(record,)| serde_json::from_str(&record).map_err(ConveyorError::from))
            .transpose()
    }

    async fn query(&self, filter: &ResultFilter) -> Result<Vec<TaskResult>> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT record FROM task_results WHERE 1 = 1",
        );
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(queue) = &filter.queue {
            builder.push(" AND queue = ").push_bind(queue.clone());
        }
        if let Some(task_name) = &filter.task_name {
            builder
                .push(" AND task_name = ")
                .push_bind(task_name.clone());
        }
        if let Some(since) = filter.since {
            builder
                .push(" AND enqueued_at_ms >= ")
                .push_bind(since.timestamp_millis());
        }
        if let Some(until) = filter.until {
            builder
                .push(" AND enqueued_at_ms <= ")
                .push_bind(until.timestamp_millis());
        }
        builder.push(" ORDER BY enqueued_at_ms DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(store_unavailable)?;
        rows.into_iter()
            .map(|row| {
                let record: String = row.try_get("record").map_err(store_unavailable)?;
                serde_json::from_str(&record).map_err(ConveyorError::from)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::models::TaskStatus;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteEventStore {
        let url = format!("sqlite://{}", dir.path().join("conveyor.db").display());
        SqliteEventStore::connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn records_survive_a_reopen() {
        let dir = TempDir::new().unwrap();
        let env = TaskEnvelope::new("tasks.a", "default");
        {
            let store = open_store(&dir).await;
            store.create_pending(&env).await.unwrap();
            store.mark_started(&env, "w-1").await.unwrap();
            store
                .complete(env.id, "w-1", serde_json::json!("done"))
                .await
                .unwrap();
        }

        let reopened = open_store(&dir).await;
        let record = reopened.get(env.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(record.result, Some(serde_json::json!("done")));
        assert_eq!(record.worker_id.as_deref(), Some("w-1"));
    }

    #[tokio::test]
    async fn transition_rules_hold_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let env = TaskEnvelope::new("tasks.a", "default");

        store.create_pending(&env).await.unwrap();
        // PENDING cannot jump straight to SUCCESS.
        let err = store
            .complete(env.id, "w-1", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidTransition { .. }));

        store.mark_started(&env, "w-1").await.unwrap();
        store
            .fail(env.id, "w-1", TaskError::handler("boom"))
            .await
            .unwrap();
        // Terminal is terminal.
        let err = store
            .complete(env.id, "w-2", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn query_filters_translate_to_sql() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let fast = TaskEnvelope::new("tasks.a", "fast");
        let slow = TaskEnvelope::new("tasks.b", "slow");
        store.create_pending(&fast).await.unwrap();
        store.create_pending(&slow).await.unwrap();
        store.mark_started(&fast, "w-1").await.unwrap();
        store
            .complete(fast.id, "w-1", serde_json::Value::Null)
            .await
            .unwrap();

        let done = store
            .query(&ResultFilter::default().with_status(TaskStatus::Success))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].task_id, fast.id);

        let slow_queue = store
            .query(&ResultFilter::default().with_queue("slow"))
            .await
            .unwrap();
        assert_eq!(slow_queue.len(), 1);
        assert_eq!(slow_queue[0].task_id, slow.id);

        let by_name = store
            .query(&ResultFilter::default().with_task_name("tasks.a").limit(10))
            .await
            .unwrap();
        assert_eq!(by_name.len(), 1);
    }

    #[tokio::test]
    async fn idempotency_key_lookup_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let env = TaskEnvelope::new("tasks.a", "default").with_idempotency_key("req-1");
        store.create_pending(&env).await.unwrap();

        let found = store.find_by_idempotency_key("req-1").await.unwrap();
        assert_eq!(found.unwrap().task_id, env.id);
        assert!(store
            .find_by_idempotency_key("req-2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn revoke_is_durable_and_raced_safely() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let env = TaskEnvelope::new("tasks.a", "default");
        store.create_pending(&env).await.unwrap();

        assert!(store.revoke(env.id).await.unwrap());
        assert!(!store.revoke(env.id).await.unwrap());

        let record = store.get(env.id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Revoked);
    }
}
