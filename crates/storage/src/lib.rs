//! ferry-storage: persistence contract for data flows.
//!
//! The store is the single source of truth for flow state and the only
//! coordination point between runtimes. Exclusive processing rights are
//! expressed as leases embedded in each flow; writes are guarded by the
//! flow's optimistic-concurrency version and by the lease holder.

pub mod conformance;
mod error;
mod memory;
mod traits;

pub use error::StorageError;
pub use memory::InMemoryDataFlowStore;
pub use traits::{DataFlowStore, FlowQuery, LeaseMode, SaveMode};
