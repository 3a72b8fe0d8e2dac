//! Component wiring: pick backends from the configuration, build the
//! shared registry, run the selected components until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use conveyor_beat::BeatScheduler;
use conveyor_broker::{
    MemoryBroker, MemoryEventStore, MemoryLeaderLock, SqliteBroker, SqliteEventStore,
    SqliteLeaderLock,
};
use conveyor_core::config::AppConfig;
use conveyor_core::traits::{Broker, EventStore, LeaderLock};
use conveyor_core::{TaskPolicy, TaskRegistry};
use conveyor_worker::handlers::{HttpHandler, ShellHandler};
use conveyor_worker::WorkerPool;

/// Which components this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Worker,
    Beat,
    All,
}

impl AppMode {
    fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }

    fn runs_beat(self) -> bool {
        matches!(self, AppMode::Beat | AppMode::All)
    }
}

pub struct Application {
    config: AppConfig,
    mode: AppMode,
    broker: Arc<dyn Broker>,
    store: Arc<dyn EventStore>,
    lock: Arc<dyn LeaderLock>,
    registry: Arc<TaskRegistry>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        let (broker, store, lock): (Arc<dyn Broker>, Arc<dyn EventStore>, Arc<dyn LeaderLock>) =
            if config.store.database_url == "memory" {
                // The memory queue is process-local; a standalone worker or
                // beat would enqueue into (or poll) a queue no other
                // process can see.
                if mode != AppMode::All {
                    anyhow::bail!(
                        "mode {mode:?} requires a sqlite database_url shared between processes"
                    );
                }
                info!("using in-memory backends");
                (
                    Arc::new(MemoryBroker::new()),
                    Arc::new(MemoryEventStore::new()),
                    Arc::new(MemoryLeaderLock::new()),
                )
            } else {
                info!(url = %config.store.database_url, "using sqlite backends");
                let pool = conveyor_broker::connect(&config.store.database_url)
                    .await
                    .context("opening sqlite database")?;
                (
                    Arc::new(SqliteBroker::new(pool.clone())),
                    Arc::new(SqliteEventStore::new(pool.clone())),
                    Arc::new(SqliteLeaderLock::new(pool, config.beat.lock_name.clone())),
                )
            };
        let registry = Arc::new(built_in_registry()?);
        info!(tasks = ?registry.task_names(), "task registry initialized");

        Ok(Self {
            config,
            mode,
            broker,
            store,
            lock,
            registry,
        })
    }

    /// Run the selected components until the shutdown flag flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut components = JoinSet::new();

        if self.mode.runs_worker() {
            let pool = WorkerPool::new(
                Arc::clone(&self.broker),
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                &self.config,
            );
            let rx = shutdown.clone();
            components.spawn(async move { pool.run(rx).await });
        }

        if self.mode.runs_beat() {
            let mut beat = BeatScheduler::new(
                Arc::clone(&self.broker),
                Arc::clone(&self.store),
                Arc::clone(&self.lock),
                Arc::clone(&self.registry),
                &self.config,
            )
            .context("building beat scheduler")?;
            let rx = shutdown.clone();
            components.spawn(async move { beat.run(rx).await });
        }

        drop(shutdown);
        while let Some(joined) = components.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "component exited with error"),
                Err(e) => error!(error = %e, "component task aborted"),
            }
        }
        Ok(())
    }
}

/// Registry with the built-in handlers. Applications embedding conveyor as
/// a library build their own registry instead.
fn built_in_registry() -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry.register("tasks.shell", Arc::new(ShellHandler), TaskPolicy::default())?;
    registry.register(
        "tasks.http_request",
        Arc::new(HttpHandler::new()),
        TaskPolicy::default(),
    )?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn split_modes_require_a_shared_database() {
        // Default configuration keeps everything in process memory; a
        // standalone worker or beat cannot reach such a queue.
        let config = AppConfig::default();
        let err = Application::new(config, AppMode::Worker)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("database_url"));

        let config = AppConfig::default();
        let err = Application::new(config, AppMode::Beat).await.err().unwrap();
        assert!(err.to_string().contains("database_url"));
    }
}
