//! Leader lock on sqlite: one row per lock name, claimed and renewed with
//! compare-and-set statements so competing instances on the same database
//! cannot both hold it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;

use conveyor_core::traits::LeaderLock;
use conveyor_core::Result;

use crate::sqlite::store_unavailable;

pub struct SqliteLeaderLock {
    pool: SqlitePool,
    name: String,
}

impl SqliteLeaderLock {
    pub fn new(pool: SqlitePool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }
}

fn expiry_ms(ttl: Duration, now_ms: i64) -> i64 {
    now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64)
}

#[async_trait]
impl LeaderLock for SqliteLeaderLock {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        // The conditional upsert claims the row when it is new, expired, or
        // already ours; otherwise zero rows are affected.
        let result = sqlx::query(
            "INSERT INTO leader_locks (name, holder, expires_at_ms)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at_ms = excluded.expires_at_ms
             WHERE leader_locks.holder = excluded.holder
                OR leader_locks.expires_at_ms <= ?4",
        )
        .bind(&self.name)
        .bind(holder)
        .bind(expiry_ms(ttl, now_ms))
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(store_unavailable)?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE leader_locks
             SET expires_at_ms = ?1
             WHERE name = ?2 AND holder = ?3 AND expires_at_ms > ?4",
        )
        .bind(expiry_ms(ttl, now_ms))
        .bind(&self.name)
        .bind(holder)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .map_err(store_unavailable)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM leader_locks WHERE name = ?1 AND holder = ?2")
            .bind(&self.name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(store_unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::connect;
    use tempfile::TempDir;

    async fn open_pool(dir: &TempDir) -> SqlitePool {
        let url = format!("sqlite://{}", dir.path().join("conveyor.db").display());
        connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn only_one_holder_at_a_time() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir).await;
        let lock_a = SqliteLeaderLock::new(pool.clone(), "conveyor-beat");
        let lock_b = SqliteLeaderLock::new(pool, "conveyor-beat");
        let ttl = Duration::from_secs(10);

        assert!(lock_a.try_acquire("beat-1", ttl).await.unwrap());
        assert!(!lock_b.try_acquire("beat-2", ttl).await.unwrap());
        // Idempotent for the current holder.
        assert!(lock_a.try_acquire("beat-1", ttl).await.unwrap());

        assert!(lock_a.renew("beat-1", ttl).await.unwrap());
        assert!(!lock_b.renew("beat-2", ttl).await.unwrap());

        lock_a.release("beat-1").await.unwrap();
        assert!(lock_b.try_acquire("beat-2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_is_claimable() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir).await;
        let lock = SqliteLeaderLock::new(pool, "conveyor-beat");

        assert!(lock
            .try_acquire("beat-1", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(lock
            .try_acquire("beat-2", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!lock.renew("beat-1", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_lock_names_are_independent() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir).await;
        let beat = SqliteLeaderLock::new(pool.clone(), "conveyor-beat");
        let other = SqliteLeaderLock::new(pool, "conveyor-sweeper");
        let ttl = Duration::from_secs(10);

        assert!(beat.try_acquire("a", ttl).await.unwrap());
        assert!(other.try_acquire("b", ttl).await.unwrap());
    }
}
