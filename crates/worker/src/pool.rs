//! Fixed-size pool of worker slots polling the broker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use conveyor_core::config::AppConfig;
use conveyor_core::traits::{Broker, EventStore};
use conveyor_core::{Result, TaskRegistry};

use crate::executor::TaskExecutor;

/// `concurrency` independent slots, each leasing and executing one envelope
/// at a time across the configured queues. Shutdown is cooperative: slots
/// finish their in-flight task, bounded by the drain timeout.
pub struct WorkerPool {
    executor: Arc<TaskExecutor>,
    worker_id: String,
    queues: Vec<String>,
    concurrency: usize,
    poll_interval: Duration,
    drain_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn EventStore>,
        registry: Arc<TaskRegistry>,
        config: &AppConfig,
    ) -> Self {
        let executor = TaskExecutor::new(
            broker,
            store,
            registry,
            config.retry.to_policy(),
            &config.broker,
            &config.worker,
        );
        Self {
            executor: Arc::new(executor),
            worker_id: config.worker.effective_worker_id(),
            queues: config.worker.queues.clone(),
            concurrency: config.worker.concurrency,
            poll_interval: config.broker.poll_interval(),
            drain_timeout: config.worker.drain_timeout(),
        }
    }

    /// Run until `shutdown` flips to true, then drain in-flight tasks.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker_id = %self.worker_id,
            concurrency = self.concurrency,
            queues = ?self.queues,
            "worker pool starting"
        );
        let mut slots = JoinSet::new();
        for slot in 0..self.concurrency {
            let slot_id = format!("{}-{slot}", self.worker_id);
            slots.spawn(slot_loop(
                Arc::clone(&self.executor),
                slot_id,
                self.queues.clone(),
                self.poll_interval,
                shutdown.clone(),
            ));
        }

        let mut shutdown = shutdown;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(worker_id = %self.worker_id, "shutdown signalled, draining worker slots");
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = slots.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "worker slot aborted");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                timeout = ?self.drain_timeout,
                "drain timeout elapsed, aborting remaining slots"
            );
            slots.shutdown().await;
        }
        info!(worker_id = %self.worker_id, "worker pool stopped");
        Ok(())
    }
}

async fn slot_loop(
    executor: Arc<TaskExecutor>,
    slot_id: String,
    queues: Vec<String>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(slot_id = %slot_id, "worker slot started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut idle = true;
        for queue in &queues {
            match executor.poll_once(queue, &slot_id).await {
                Ok(Some(_)) => idle = false,
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    warn!(slot_id = %slot_id, error = %e, "backend unavailable, backing off");
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => {
                    error!(slot_id = %slot_id, queue = %queue, error = %e, "task processing failed");
                }
            }
        }
        if idle {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
    debug!(slot_id = %slot_id, "worker slot stopped");
}
