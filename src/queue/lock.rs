use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::task::TaskId;
use crate::core::error::EngineResult;

/// Exclusive, expiring claims keyed by task id.
/// At most one holder may own a task's lock at any time.
#[async_trait]
pub trait TaskLockManager: Send + Sync {
    /// True when `holder` now owns the lock. Expired locks may be taken over.
    async fn acquire(&self, task_id: TaskId, holder: &str, ttl_ms: u64) -> EngineResult<bool>;

    /// True when `holder` owned the lock and gave it up
    async fn release(&self, task_id: TaskId, holder: &str) -> EngineResult<bool>;

    async fn holder(&self, task_id: TaskId) -> EngineResult<Option<String>>;
}

/// Single-process lock table
#[derive(Debug, Default)]
pub struct InMemoryTaskLockManager {
    locks: Mutex<HashMap<TaskId, (String, DateTime<Utc>)>>,
}

impl InMemoryTaskLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskLockManager for InMemoryTaskLockManager {
    async fn acquire(&self, task_id: TaskId, holder: &str, ttl_ms: u64) -> EngineResult<bool> {
        let now = Utc::now();
        let mut locks = self.locks.lock().await;
        if let Some((current, expires)) = locks.get(&task_id) {
            if *expires > now && current != holder {
                return Ok(false);
            }
        }
        locks.insert(
            task_id,
            (holder.to_string(), now + Duration::milliseconds(ttl_ms as i64)),
        );
        Ok(true)
    }

    async fn release(&self, task_id: TaskId, holder: &str) -> EngineResult<bool> {
        let mut locks = self.locks.lock().await;
        match locks.get(&task_id) {
            Some((current, _)) if current == holder => {
                locks.remove(&task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, task_id: TaskId) -> EngineResult<Option<String>> {
        let now = Utc::now();
        Ok(self
            .locks
            .lock()
            .await
            .get(&task_id)
            .filter(|(_, expires)| *expires > now)
            .map(|(holder, _)| holder.clone()))
    }
}
