//! Core building blocks for the conveyor task scheduling system.
//!
//! This crate defines the domain models (envelopes, results, schedules,
//! leases), the error taxonomy, the port traits implemented by the broker
//! and event store backends, the task registry and the retry policy. It
//! contains no I/O of its own.

pub mod config;
pub mod errors;
pub mod models;
pub mod registry;
pub mod retry;
pub mod traits;

pub use errors::{ConveyorError, Result};
pub use models::{
    ResultFilter, ScheduleEntry, ScheduleSpec, TaskEnvelope, TaskError, TaskErrorKind, TaskId,
    TaskResult, TaskStatus, WorkerLease,
};
pub use registry::{TaskContext, TaskHandler, TaskPolicy, TaskRegistry};
pub use retry::RetryPolicy;
pub use traits::{Broker, EventStore, LeaderLock};
