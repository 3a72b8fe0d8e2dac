//! Shared sqlite pool setup. The schema is created on connect, so a fresh
//! database file is usable without a separate migration step.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use conveyor_core::{ConveyorError, Result};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS task_results (
        task_id TEXT PRIMARY KEY,
        root_id TEXT NOT NULL,
        status TEXT NOT NULL,
        task_name TEXT NOT NULL,
        queue TEXT NOT NULL,
        idempotency_key TEXT,
        enqueued_at_ms INTEGER NOT NULL,
        record TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_results_status
        ON task_results (status)",
    "CREATE INDEX IF NOT EXISTS idx_task_results_idempotency_key
        ON task_results (idempotency_key)",
    "CREATE TABLE IF NOT EXISTS leader_locks (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS task_queue (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL UNIQUE,
        queue TEXT NOT NULL,
        eta_ms INTEGER NOT NULL,
        lease_worker TEXT,
        lease_expires_ms INTEGER,
        envelope BLOB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_task_queue_ready
        ON task_queue (queue, eta_ms)",
];

/// Open (creating if missing) the sqlite database at `url` and make sure
/// the schema exists. The returned pool is shared by the event store and
/// the leader lock.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| ConveyorError::Configuration(format!("invalid sqlite url {url}: {e}")))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(store_unavailable)?;
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .map_err(store_unavailable)?;
    }
    Ok(pool)
}

/// Database failures surface as transient `StoreUnavailable` so callers
/// retry with backoff instead of recording a task failure.
pub(crate) fn store_unavailable(e: sqlx::Error) -> ConveyorError {
    ConveyorError::StoreUnavailable(e.to_string())
}
