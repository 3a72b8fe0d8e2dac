use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::Result;

/// Unique identifier of a single task envelope generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A single unit of work submitted for asynchronous execution.
///
/// Envelopes are immutable once enqueued. A retry never mutates an existing
/// envelope; it produces a new generation via [`TaskEnvelope::next_generation`]
/// linked to its predecessor through `parent_id` and sharing the original
/// submission's `root_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: TaskId,
    /// Id of the original generation-zero envelope of this lineage.
    pub root_id: TaskId,
    /// Previous generation, if this envelope was produced by a retry.
    pub parent_id: Option<TaskId>,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Not runnable before this time. Honored by the broker: the envelope is
    /// invisible to consumers until the eta elapses.
    pub eta: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl TaskEnvelope {
    pub fn new(task_name: impl Into<String>, queue: impl Into<String>) -> Self {
        let id = TaskId::new();
        Self {
            id,
            root_id: id,
            parent_id: None,
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            queue: queue.into(),
            enqueued_at: Utc::now(),
            retry_count: 0,
            max_retries: 0,
            eta: None,
            idempotency_key: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Eta elapsed (or absent), so the envelope is visible to consumers.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.eta.map_or(true, |eta| eta <= now)
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Build the next generation of this envelope for a retry.
    ///
    /// The new envelope gets a fresh id, `retry_count + 1`, and the given
    /// backoff eta. Callers must check [`retries_remaining`] first.
    ///
    /// [`retries_remaining`]: TaskEnvelope::retries_remaining
    pub fn next_generation(&self, eta: Option<DateTime<Utc>>) -> Self {
        debug_assert!(self.retries_remaining());
        Self {
            id: TaskId::new(),
            root_id: self.root_id,
            parent_id: Some(self.id),
            task_name: self.task_name.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            queue: self.queue.clone(),
            enqueued_at: Utc::now(),
            retry_count: self.retry_count + 1,
            max_retries: self.max_retries,
            eta,
            idempotency_key: None,
        }
    }

    /// Wire encoding: the broker treats the payload as opaque bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
