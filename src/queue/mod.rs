//! Priority task queue feeding swarm work to workers

pub mod lock;
pub mod priority;
pub mod store;
pub mod task;
pub mod worker;

pub use lock::{InMemoryTaskLockManager, TaskLockManager};
pub use priority::compute_priority;
pub use store::{InMemoryTaskQueue, TaskQueue};
pub use task::{QueuedTask, StatusChange, TaskId, TaskPayload, TaskStatus};
pub use worker::{QueueWorker, TaskHandler};
