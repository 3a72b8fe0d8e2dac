//! Task registry: maps task names to handler capabilities and execution
//! policies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{ConveyorError, Result};
use crate::models::TaskEnvelope;
use crate::traits::EventStore;

/// Execution context handed to a handler.
///
/// Besides argument access it carries the cooperative cancellation probe:
/// handlers that want to be revocable call [`checkpoint`] between units of
/// work. True preemption of an in-flight handler is out of scope.
///
/// [`checkpoint`]: TaskContext::checkpoint
pub struct TaskContext {
    envelope: TaskEnvelope,
    store: Arc<dyn EventStore>,
}

impl TaskContext {
    pub fn new(envelope: TaskEnvelope, store: Arc<dyn EventStore>) -> Self {
        Self { envelope, store }
    }

    pub fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.envelope.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.envelope.kwargs.get(key)
    }

    /// Returns `Err(Revoked)` once the task has been revoked. Handlers that
    /// never call this cannot be halted mid-execution.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.store.is_revoked(self.envelope.id).await? {
            Err(ConveyorError::Revoked(self.envelope.id))
        } else {
            Ok(())
        }
    }
}

/// A registered task's capability.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> Result<Value>;
}

/// Per-task execution policy: defaults applied at submission time.
#[derive(Debug, Clone)]
pub struct TaskPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub queue: String,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(300),
            queue: "default".to_string(),
        }
    }
}

impl TaskPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }
}

struct RegisteredTask {
    handler: Arc<dyn TaskHandler>,
    policy: TaskPolicy,
}

/// Static mapping task name -> handler + policy.
///
/// Built during initialization, immutable afterwards; lookups during
/// execution need no locking.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        task_name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        policy: TaskPolicy,
    ) -> Result<()> {
        let task_name = task_name.into();
        if self.tasks.contains_key(&task_name) {
            return Err(ConveyorError::DuplicateHandler(task_name));
        }
        self.tasks.insert(task_name, RegisteredTask { handler, policy });
        Ok(())
    }

    /// Resolve a handler. `UnknownTask` is fatal and never retried; it must
    /// stay distinguishable from a handler-raised business error.
    pub fn resolve(&self, task_name: &str) -> Result<(Arc<dyn TaskHandler>, &TaskPolicy)> {
        self.tasks
            .get(task_name)
            .map(|t| (Arc::clone(&t.handler), &t.policy))
            .ok_or_else(|| ConveyorError::UnknownTask(task_name.to_string()))
    }

    pub fn policy(&self, task_name: &str) -> Result<&TaskPolicy> {
        self.tasks
            .get(task_name)
            .map(|t| &t.policy)
            .ok_or_else(|| ConveyorError::UnknownTask(task_name.to_string()))
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.tasks.contains_key(task_name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
