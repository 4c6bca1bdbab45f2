//! Shared blackboard state readable and writable by all tiers.

pub mod blackboard;
pub mod store;

pub use blackboard::SwarmContext;
pub use store::{ContextStore, InMemoryContextStore, SwarmRecord};
