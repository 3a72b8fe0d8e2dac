//! Producer-side API: submit tasks against the registry, look up and wait
//! for results, revoke queued or running work.

mod client;

pub use client::{Client, SubmitOptions};
