pub mod context;
pub mod core;
pub mod database;
pub mod events;
pub mod navigation;
pub mod orchestration;
pub mod queue;
pub mod reasoning;
pub mod resources;
pub mod strategies;
pub mod swarm;
