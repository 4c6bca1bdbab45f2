use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::lock::TaskLockManager;
use super::priority::compute_priority;
use super::task::{QueuedTask, StatusChange, TaskId, TaskPayload, TaskStatus};
use crate::core::config::QueueConfig;
use crate::core::error::{EngineError, EngineResult};

/// Priority queue of swarm work shared by all workers.
///
/// Delivery is at-least-once: a claim whose lease runs out is handed out
/// again. The lock manager keeps a task active on one worker at a time.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn schedule(
        &self,
        payload: TaskPayload,
        requester_id: &str,
        premium: bool,
    ) -> EngineResult<TaskId>;

    /// One entry per id, `None` for unknown ids
    async fn get_statuses(&self, ids: &[TaskId]) -> EngineResult<Vec<Option<TaskStatus>>>;

    /// Requester-driven status change, recorded in the audit log
    async fn change_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        requester_id: &str,
    ) -> EngineResult<()>;

    async fn get(&self, id: TaskId) -> EngineResult<QueuedTask>;

    /// Highest-priority scheduled task, now active and leased to `worker_id`
    async fn claim_next(&self, worker_id: &str) -> EngineResult<Option<QueuedTask>>;

    async fn complete(&self, id: TaskId, worker_id: &str, result: Value) -> EngineResult<()>;

    async fn fail(&self, id: TaskId, worker_id: &str, reason: &str) -> EngineResult<()>;

    /// Return expired claims to the queue, or fail them after too many deliveries
    async fn requeue_expired(&self, now: DateTime<Utc>) -> EngineResult<Vec<TaskId>>;

    async fn audit_log(&self, id: TaskId) -> EngineResult<Vec<StatusChange>>;
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<TaskId, QueuedTask>,
    ready: BTreeSet<(u32, u64, TaskId)>,
    audit: Vec<StatusChange>,
    next_seq: u64,
}

impl QueueState {
    fn require_mut(&mut self, id: TaskId) -> EngineResult<&mut QueuedTask> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", id)))
    }

    fn transition(&mut self, id: TaskId, to: TaskStatus, requester_id: &str) -> EngineResult<()> {
        let now = Utc::now();
        let task = self.require_mut(id)?;
        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        task.status = to;
        task.updated_at = now;
        let key = (task.priority, task.seq, task.id);
        if to != TaskStatus::Active {
            task.claimed_by = None;
            task.lease_expires_at = None;
        }

        match to {
            TaskStatus::Scheduled => {
                self.ready.insert(key);
            }
            _ => {
                self.ready.remove(&key);
            }
        }
        self.audit.push(StatusChange {
            task_id: id,
            from,
            to,
            requester_id: requester_id.to_string(),
            at: now,
        });
        Ok(())
    }

    fn check_claim(&self, id: TaskId, worker_id: &str) -> EngineResult<()> {
        let task = self
            .tasks
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", id)))?;
        if task.status != TaskStatus::Active || task.claimed_by.as_deref() != Some(worker_id) {
            return Err(EngineError::NotEligible(format!(
                "task {} is not claimed by {}",
                id, worker_id
            )));
        }
        Ok(())
    }
}

/// Single-process queue
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    locks: Arc<dyn TaskLockManager>,
    config: QueueConfig,
}

impl InMemoryTaskQueue {
    pub fn new(locks: Arc<dyn TaskLockManager>, config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            locks,
            config,
        }
    }

    fn worker_identity(worker_id: &str) -> String {
        format!("worker:{}", worker_id)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn schedule(
        &self,
        payload: TaskPayload,
        requester_id: &str,
        premium: bool,
    ) -> EngineResult<TaskId> {
        let priority = compute_priority(
            self.config.base_priority,
            self.config.premium_adjustment,
            premium,
        );
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;

        let task = QueuedTask {
            id: TaskId::new(),
            payload,
            priority,
            status: TaskStatus::Scheduled,
            requester_id: requester_id.to_string(),
            premium,
            attempts: 0,
            claimed_by: None,
            lease_expires_at: None,
            result: None,
            error: None,
            seq,
            created_at: now,
            updated_at: now,
        };
        let id = task.id;
        state.ready.insert((priority, seq, id));
        state.tasks.insert(id, task);
        info!(
            "Scheduled task {} for {} at priority {}",
            id, requester_id, priority
        );
        Ok(id)
    }

    async fn get_statuses(&self, ids: &[TaskId]) -> EngineResult<Vec<Option<TaskStatus>>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .map(|id| state.tasks.get(id).map(|t| t.status))
            .collect())
    }

    async fn change_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        requester_id: &str,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        let holder = state.tasks.get(&id).and_then(|t| t.claimed_by.clone());
        state.transition(id, status, requester_id)?;
        drop(state);

        if status != TaskStatus::Active {
            if let Some(worker) = holder {
                self.locks.release(id, &worker).await?;
            }
        }
        info!("Task {} moved to {} by {}", id, status, requester_id);
        Ok(())
    }

    async fn get(&self, id: TaskId) -> EngineResult<QueuedTask> {
        self.state
            .lock()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("task {}", id)))
    }

    async fn claim_next(&self, worker_id: &str) -> EngineResult<Option<QueuedTask>> {
        let mut state = self.state.lock().await;
        let candidates: Vec<TaskId> = state.ready.iter().map(|(_, _, id)| *id).collect();

        for id in candidates {
            if !self
                .locks
                .acquire(id, worker_id, self.config.lock_ttl_ms)
                .await?
            {
                debug!("Task {} is locked by another worker", id);
                continue;
            }

            state.transition(id, TaskStatus::Active, &Self::worker_identity(worker_id))?;
            let task = state.require_mut(id)?;
            task.attempts += 1;
            task.claimed_by = Some(worker_id.to_string());
            task.lease_expires_at =
                Some(Utc::now() + Duration::milliseconds(self.config.lock_ttl_ms as i64));
            debug!(
                "Worker {} claimed task {} (delivery {})",
                worker_id, id, task.attempts
            );
            return Ok(Some(task.clone()));
        }
        Ok(None)
    }

    async fn complete(&self, id: TaskId, worker_id: &str, result: Value) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.check_claim(id, worker_id)?;
        state.transition(id, TaskStatus::Completed, &Self::worker_identity(worker_id))?;
        state.require_mut(id)?.result = Some(result);
        drop(state);
        self.locks.release(id, worker_id).await?;
        info!("Task {} completed by {}", id, worker_id);
        Ok(())
    }

    async fn fail(&self, id: TaskId, worker_id: &str, reason: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.check_claim(id, worker_id)?;
        state.transition(id, TaskStatus::Failed, &Self::worker_identity(worker_id))?;
        state.require_mut(id)?.error = Some(reason.to_string());
        drop(state);
        self.locks.release(id, worker_id).await?;
        warn!("Task {} failed on {}: {}", id, worker_id, reason);
        Ok(())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> EngineResult<Vec<TaskId>> {
        let mut state = self.state.lock().await;
        let expired: Vec<(TaskId, u32, Option<String>)> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Active
                    && t.lease_expires_at.map(|at| at <= now).unwrap_or(false)
            })
            .map(|t| (t.id, t.attempts, t.claimed_by.clone()))
            .collect();

        let mut requeued = Vec::new();
        for (id, attempts, holder) in expired {
            if attempts >= self.config.max_deliveries {
                state.transition(id, TaskStatus::Failed, "queue")?;
                state.require_mut(id)?.error =
                    Some(format!("lease expired after {} deliveries", attempts));
                warn!("Task {} failed after {} deliveries", id, attempts);
            } else {
                state.transition(id, TaskStatus::Scheduled, "queue")?;
                info!("Task {} lease expired, requeued", id);
                requeued.push(id);
            }
            if let Some(worker) = holder {
                self.locks.release(id, &worker).await?;
            }
        }
        Ok(requeued)
    }

    async fn audit_log(&self, id: TaskId) -> EngineResult<Vec<StatusChange>> {
        Ok(self
            .state
            .lock()
            .await
            .audit
            .iter()
            .filter(|c| c.task_id == id)
            .cloned()
            .collect())
    }
}
