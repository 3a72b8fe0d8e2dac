//! Periodic scheduler ("beat"): turns the configured schedule table into
//! envelopes on the broker queue, exactly one instance at a time thanks to
//! the leader lock.

mod scheduler;

pub use scheduler::BeatScheduler;
