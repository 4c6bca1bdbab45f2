//! Hierarchical resource leases: swarm pool → run → step.

pub mod allocation;
pub mod allocator;
pub mod pool;
pub mod store;

pub use allocation::*;
pub use allocator::ResourceAllocator;
pub use pool::ResourcePool;
pub use store::{AllocationStore, ChildGrant, InMemoryAllocationStore};
