//! Worker pool: leases envelopes from the broker, runs the registered
//! handler under its timeout budget, and records the outcome in the event
//! store before acknowledging the delivery.

mod executor;
pub mod handlers;
mod pool;

pub use executor::{Outcome, TaskExecutor};
pub use pool::WorkerPool;
