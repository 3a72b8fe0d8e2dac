//! Port traits implemented by the broker and store backends.

mod broker;
mod event_store;
mod leader;

pub use broker::Broker;
pub use event_store::EventStore;
pub use leader::LeaderLock;
