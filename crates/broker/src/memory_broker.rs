//! In-process broker queue with lease-based at-least-once delivery.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use conveyor_core::models::{TaskEnvelope, TaskId, WorkerLease};
use conveyor_core::traits::Broker;
use conveyor_core::{ConveyorError, Result};

/// Delayed envelope ordered by eta, sequence number as FIFO tie-break.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    eta: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.eta, self.seq).cmp(&(other.eta, other.seq))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TaskId>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    envelopes: HashMap<TaskId, TaskEnvelope>,
    leases: HashMap<TaskId, WorkerLease>,
    seq: u64,
}

impl BrokerState {
    /// Expired leases hand their envelopes back to the head of their queue
    /// so a crashed worker's task is redelivered before newer work.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<TaskId> = self
            .leases
            .values()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| lease.task_id)
            .collect();
        for task_id in expired {
            if let Some(lease) = self.leases.remove(&task_id) {
                warn!(
                    task_id = %task_id,
                    worker_id = %lease.worker_id,
                    queue = %lease.queue,
                    "lease expired, reclaiming envelope for redelivery"
                );
                if self.envelopes.contains_key(&task_id) {
                    self.queues
                        .entry(lease.queue)
                        .or_default()
                        .ready
                        .push_front(task_id);
                }
            }
        }
    }

    /// Move delayed envelopes whose eta has elapsed into the ready queue.
    fn promote_due(&mut self, queue: &str, now: DateTime<Utc>) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        while let Some(Reverse(entry)) = state.delayed.peek() {
            if entry.eta > now {
                break;
            }
            let task_id = entry.task_id;
            state.delayed.pop();
            state.ready.push_back(task_id);
        }
    }
}

/// Broker backed by process memory: per-queue FIFO of ready envelopes plus
/// an eta-ordered heap of delayed ones, and a lease table for in-flight
/// deliveries. Everything in one mutex; contention is bounded by worker
/// concurrency, which is small.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        let mut state = self.state.lock().await;
        // Re-enqueueing a known envelope id is a crash-recovery duplicate.
        if state.envelopes.contains_key(&envelope.id) {
            return Ok(());
        }
        let now = Utc::now();
        let task_id = envelope.id;
        let queue = envelope.queue.clone();
        let eta = envelope.eta;
        state.envelopes.insert(task_id, envelope);
        state.seq += 1;
        let seq = state.seq;
        let queue_state = state.queues.entry(queue).or_default();
        match eta {
            Some(eta) if eta > now => {
                queue_state
                    .delayed
                    .push(Reverse(DelayedEntry { eta, seq, task_id }));
            }
            _ => queue_state.ready.push_back(task_id),
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<TaskEnvelope>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.reclaim_expired(now);
        state.promote_due(queue, now);

        loop {
            let Some(task_id) = state
                .queues
                .get_mut(queue)
                .and_then(|q| q.ready.pop_front())
            else {
                return Ok(None);
            };
            // An id whose envelope is gone was acknowledged concurrently.
            let Some(envelope) = state.envelopes.get(&task_id).cloned() else {
                continue;
            };
            let lease = WorkerLease::new(worker_id, queue, task_id, lease_duration, now);
            state.leases.insert(task_id, lease);
            return Ok(Some(envelope));
        }
    }

    async fn acknowledge(&self, task_id: TaskId, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match state.leases.get(&task_id) {
            Some(lease) if lease.worker_id == worker_id && !lease.is_expired(now) => {}
            _ => {
                return Err(ConveyorError::LeaseExpired {
                    task_id,
                    worker_id: worker_id.to_string(),
                })
            }
        }
        state.leases.remove(&task_id);
        state.envelopes.remove(&task_id);
        Ok(())
    }

    async fn extend_lease(
        &self,
        task_id: TaskId,
        worker_id: &str,
        extension: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match state.leases.get_mut(&task_id) {
            Some(lease) if lease.worker_id == worker_id && !lease.is_expired(now) => {
                lease.extend(extension);
                Ok(())
            }
            _ => Err(ConveyorError::LeaseExpired {
                task_id,
                worker_id: worker_id.to_string(),
            }),
        }
    }

    async fn release_lease(&self, task_id: TaskId, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let queue = match state.leases.get(&task_id) {
            Some(lease) if lease.worker_id == worker_id => lease.queue.clone(),
            _ => {
                return Err(ConveyorError::LeaseExpired {
                    task_id,
                    worker_id: worker_id.to_string(),
                })
            }
        };
        state.leases.remove(&task_id);
        if state.envelopes.contains_key(&task_id) {
            // Head of the queue: a released envelope is older than anything
            // enqueued since.
            state
                .queues
                .entry(queue)
                .or_default()
                .ready
                .push_front(task_id);
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.delayed.len())
            .unwrap_or(0))
    }
}
