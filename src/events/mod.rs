//! Swarm notifications and the swarm → channel cache

pub mod emitter;
pub mod sink;

pub use emitter::{CacheStats, EventEmitter};
pub use sink::{BroadcastEventSink, EventSink, SwarmEvent, SwarmEventKind};
