//! Tier one: swarm lifecycle and the process-wide coordinator

pub mod coordinator;
pub mod state;

pub use coordinator::{SwarmCoordinator, SwarmReport};
pub use state::{Swarm, SwarmConfig, SwarmState};
