//! Domain models shared by every component.

mod envelope;
mod lease;
mod result;
mod schedule;

pub use envelope::{TaskEnvelope, TaskId};
pub use lease::WorkerLease;
pub use result::{ResultFilter, TaskError, TaskErrorKind, TaskResult, TaskStatus};
pub use schedule::{parse_duration, ScheduleEntry, ScheduleSpec};
