//! The beat loop: hold the leader lock, walk the schedule table every
//! tick, enqueue what is due.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use conveyor_core::config::AppConfig;
use conveyor_core::models::{ScheduleEntry, TaskEnvelope, TaskId};
use conveyor_core::traits::{Broker, EventStore, LeaderLock};
use conveyor_core::{Result, TaskRegistry};

/// Fires schedule entries at their boundaries.
///
/// Only the current leader ticks; everyone else polls the lock. Schedule
/// state lives in memory: a leader re-anchors every entry at adoption
/// time, so downtime is never backfilled unless `catch_up` says so.
pub struct BeatScheduler {
    broker: Arc<dyn Broker>,
    store: Arc<dyn EventStore>,
    lock: Arc<dyn LeaderLock>,
    registry: Arc<TaskRegistry>,
    entries: Vec<ScheduleEntry>,
    instance_id: String,
    tick_interval: Duration,
    leader_ttl: Duration,
    catch_up: bool,
    is_leader: bool,
}

impl BeatScheduler {
    /// Fails fast when the schedule references an unregistered task: a
    /// typo in the schedule table should stop the process, not produce a
    /// stream of failing envelopes.
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn EventStore>,
        lock: Arc<dyn LeaderLock>,
        registry: Arc<TaskRegistry>,
        config: &AppConfig,
    ) -> Result<Self> {
        let entries = config.beat.entries()?;
        for entry in &entries {
            registry.policy(&entry.task_name)?;
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "beat".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Ok(Self {
            broker,
            store,
            lock,
            registry,
            entries,
            instance_id: format!("{host}-beat-{}", &suffix[..8]),
            tick_interval: config.beat.tick_interval(),
            leader_ttl: config.beat.leader_ttl(),
            catch_up: config.beat.catch_up,
            is_leader: false,
        })
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            instance_id = %self.instance_id,
            entries = self.entries.len(),
            catch_up = self.catch_up,
            "beat scheduler starting"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now();
            if self.ensure_leadership(now).await {
                self.tick(now).await;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
        }
        if self.is_leader {
            self.lock.release(&self.instance_id).await?;
            self.is_leader = false;
        }
        info!(instance_id = %self.instance_id, "beat scheduler stopped");
        Ok(())
    }

    /// Acquire or renew leadership. Any doubt (lost renewal, unreachable
    /// lock) drops leadership: a missed tick is preferable to two leaders
    /// double-firing.
    async fn ensure_leadership(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_leader {
            match self.lock.renew(&self.instance_id, self.leader_ttl).await {
                Ok(true) => true,
                Ok(false) => {
                    warn!(instance_id = %self.instance_id, "leadership lost");
                    self.is_leader = false;
                    false
                }
                Err(e) => {
                    warn!(instance_id = %self.instance_id, error = %e, "leadership renewal failed");
                    self.is_leader = false;
                    false
                }
            }
        } else {
            match self.lock.try_acquire(&self.instance_id, self.leader_ttl).await {
                Ok(true) => {
                    info!(instance_id = %self.instance_id, "acquired beat leadership");
                    self.is_leader = true;
                    self.anchor_entries(now);
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    warn!(instance_id = %self.instance_id, error = %e, "leadership acquisition failed");
                    false
                }
            }
        }
    }

    /// Every entry counts boundaries from the moment of adoption. This
    /// holds for re-elections too: an instance resuming from its stale
    /// in-memory position would re-fire a boundary an interim leader
    /// already fired.
    fn anchor_entries(&mut self, now: DateTime<Utc>) {
        for entry in &mut self.entries {
            entry.anchor(now);
        }
    }

    /// Fire everything due at `now`. An entry advances only after its
    /// envelope is durably enqueued; a failed fire is retried on the next
    /// tick at the same boundary.
    async fn tick(&mut self, now: DateTime<Utc>) {
        for index in 0..self.entries.len() {
            loop {
                let Some(boundary) = self.entries[index].next_due(now, self.catch_up) else {
                    break;
                };
                let entry = self.entries[index].clone();
                match Self::fire(&*self.broker, &*self.store, &self.registry, &entry, boundary)
                    .await
                {
                    Ok(task_id) => {
                        self.entries[index].advance(boundary);
                        debug!(
                            entry = %entry.name,
                            task_id = %task_id,
                            boundary = %boundary,
                            "schedule entry fired"
                        );
                    }
                    Err(e) => {
                        warn!(
                            entry = %entry.name,
                            boundary = %boundary,
                            error = %e,
                            "failed to fire schedule entry, will retry next tick"
                        );
                        break;
                    }
                }
            }
        }
    }

    async fn fire(
        broker: &dyn Broker,
        store: &dyn EventStore,
        registry: &TaskRegistry,
        entry: &ScheduleEntry,
        boundary: DateTime<Utc>,
    ) -> Result<TaskId> {
        let policy = registry.policy(&entry.task_name)?;
        let queue = entry
            .queue
            .clone()
            .unwrap_or_else(|| policy.queue.clone());
        let envelope = TaskEnvelope::new(&entry.task_name, queue)
            .with_args(entry.args.clone())
            .with_kwargs(entry.kwargs.clone())
            .with_max_retries(policy.max_retries);
        // Record first, then enqueue: an envelope without a record would be
        // invisible to result queries.
        store.create_pending(&envelope).await?;
        if let Err(e) = broker.enqueue(envelope.clone()).await {
            // The record must not linger PENDING for an envelope that never
            // reached the queue; the retry on a later tick fires a fresh one.
            if let Err(revoke_err) = store.revoke(envelope.id).await {
                warn!(
                    task_id = %envelope.id,
                    error = %revoke_err,
                    "could not close the record of a failed fire"
                );
            }
            return Err(e);
        }
        info!(
            entry = %entry.name,
            task_name = %entry.task_name,
            task_id = %envelope.id,
            boundary = %boundary,
            "fired scheduled task"
        );
        Ok(envelope.id)
    }
}
