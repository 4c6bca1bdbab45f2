//! Tier two: runs routines step by step

pub mod orchestrator;
pub mod run;

pub use orchestrator::{RunOptions, TierTwoOrchestrator, MAX_NESTING_DEPTH};
pub use run::{Run, RunOutcome, RunStatus};
