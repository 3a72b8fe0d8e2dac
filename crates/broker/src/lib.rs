//! Backend implementations of the broker queue, event store and leader
//! lock ports.
//!
//! Two families: in-process memory backends for embedded use and tests,
//! and sqlite backends for single-node durable deployments. Both enforce
//! identical semantics because every state transition goes through the
//! transition methods on `TaskResult`.

mod memory_broker;
mod memory_store;
mod sqlite;
mod sqlite_broker;
mod sqlite_leader;
mod sqlite_store;

pub use memory_broker::MemoryBroker;
pub use memory_store::{MemoryEventStore, MemoryLeaderLock};
pub use sqlite::connect;
pub use sqlite_broker::SqliteBroker;
pub use sqlite_leader::SqliteLeaderLock;
pub use sqlite_store::SqliteEventStore;
