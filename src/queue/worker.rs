use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::store::TaskQueue;
use super::task::{QueuedTask, TaskId};
use crate::core::config::QueueConfig;
use crate::core::error::EngineResult;

/// Carries out the work a task stands for
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// `cancel` fires when the task outlives the queue timeout. The handler
    /// should wind down and return instead of being dropped mid-flight.
    async fn handle(&self, task: &QueuedTask, cancel: CancellationToken) -> EngineResult<Value>;
}

/// Pulls tasks off a shared queue and hands them to a [`TaskHandler`].
///
/// Each task is bounded by `queue.task_timeout_ms`, independent of any
/// timeout the handler applies itself. When it fires the handler is
/// cancelled and given `queue.cancel_grace_ms` to settle before the task
/// is failed; only then is it dropped.
pub struct QueueWorker {
    id: String,
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    task_timeout: Duration,
    cancel_grace: Duration,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            handler,
            task_timeout: Duration::from_millis(config.task_timeout_ms),
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process at most one task
    pub async fn process_one(&self) -> EngineResult<Option<TaskId>> {
        let Some(task) = self.queue.claim_next(&self.id).await? else {
            return Ok(None);
        };
        info!(
            "Worker {} processing task {} (delivery {})",
            self.id, task.id, task.attempts
        );

        let cancel = CancellationToken::new();
        let work = self.handler.handle(&task, cancel.clone());
        tokio::pin!(work);

        match timeout(self.task_timeout, &mut work).await {
            Ok(Ok(result)) => self.queue.complete(task.id, &self.id, result).await?,
            Ok(Err(e)) => {
                self.queue
                    .fail(task.id, &self.id, &format!("{}: {}", e.kind(), e))
                    .await?
            }
            Err(_) => {
                warn!(
                    "Task {} exceeded the {}ms queue timeout, cancelling",
                    task.id,
                    self.task_timeout.as_millis()
                );
                cancel.cancel();
                let reason = match timeout(self.cancel_grace, &mut work).await {
                    Ok(_) => format!("timed out after {}ms", self.task_timeout.as_millis()),
                    Err(_) => {
                        error!(
                            "Task {} did not settle within {}ms of cancellation",
                            task.id,
                            self.cancel_grace.as_millis()
                        );
                        format!(
                            "timed out after {}ms and did not settle within {}ms",
                            self.task_timeout.as_millis(),
                            self.cancel_grace.as_millis()
                        )
                    }
                };
                self.queue.fail(task.id, &self.id, &reason).await?
            }
        }
        Ok(Some(task.id))
    }

    /// Poll until `shutdown` fires. Expired claims are requeued on every idle tick.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Worker {} started", self.id);
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                match self.process_one().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {
                        if let Err(e) = self.queue.requeue_expired(Utc::now()).await {
                            error!("Worker {} failed to requeue expired tasks: {}", self.id, e);
                        }
                    }
                    Err(e) => error!("Worker {} failed to process a task: {}", self.id, e),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
            debug!("Worker {} stopped", self.id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use crate::queue::{InMemoryTaskLockManager, InMemoryTaskQueue, TaskPayload, TaskStatus};
    use serde_json::json;

    struct Sleepy(u64);

    #[async_trait]
    impl TaskHandler for Sleepy {
        async fn handle(&self, task: &QueuedTask, _cancel: CancellationToken) -> EngineResult<Value> {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            match &task.payload {
                TaskPayload::Swarm { goal, .. } if goal == "bad" => {
                    Err(EngineError::StrategyExecution("bad goal".into()))
                }
                TaskPayload::Swarm { goal, .. } => Ok(json!({ "goal": goal })),
            }
        }
    }

    fn setup(handler_ms: u64, task_timeout_ms: u64) -> (Arc<InMemoryTaskQueue>, QueueWorker) {
        let config = QueueConfig {
            task_timeout_ms,
            cancel_grace_ms: 10,
            ..QueueConfig::default()
        };
        let queue = Arc::new(InMemoryTaskQueue::new(
            Arc::new(InMemoryTaskLockManager::new()),
            config.clone(),
        ));
        let worker = QueueWorker::new("w1", queue.clone(), Arc::new(Sleepy(handler_ms)), &config);
        (queue, worker)
    }

    fn swarm(goal: &str) -> TaskPayload {
        TaskPayload::Swarm {
            goal: goal.into(),
            channel_id: None,
        }
    }

    #[tokio::test]
    async fn test_completes_and_fails_tasks() {
        let (queue, worker) = setup(0, 1_000);
        let ok = queue.schedule(swarm("fine"), "u", false).await.unwrap();
        let bad = queue.schedule(swarm("bad"), "u", false).await.unwrap();

        assert_eq!(worker.process_one().await.unwrap(), Some(ok));
        assert_eq!(worker.process_one().await.unwrap(), Some(bad));
        assert_eq!(worker.process_one().await.unwrap(), None);

        assert_eq!(queue.get(ok).await.unwrap().result, Some(json!({"goal": "fine"})));
        let failed = queue.get(bad).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.error.unwrap().starts_with("strategy_execution"));
    }

    #[tokio::test]
    async fn test_queue_timeout_fails_task() {
        let (queue, worker) = setup(200, 10);
        let id = queue.schedule(swarm("slow"), "u", false).await.unwrap();
        worker.process_one().await.unwrap();
        let task = queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("timed out"));
    }

    /// Stops early once cancelled and records that it saw the cancellation
    struct Cooperative {
        saw_cancel: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl TaskHandler for Cooperative {
        async fn handle(&self, _task: &QueuedTask, cancel: CancellationToken) -> EngineResult<Value> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.saw_cancel.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(json!({"stopped": true}))
                }
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(json!({"stopped": false})),
            }
        }
    }

    #[tokio::test]
    async fn test_queue_timeout_cancels_handler_and_waits_for_it() {
        let config = QueueConfig {
            task_timeout_ms: 20,
            cancel_grace_ms: 5_000,
            ..QueueConfig::default()
        };
        let queue = Arc::new(InMemoryTaskQueue::new(
            Arc::new(InMemoryTaskLockManager::new()),
            config.clone(),
        ));
        let saw_cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let worker = QueueWorker::new(
            "w1",
            queue.clone(),
            Arc::new(Cooperative {
                saw_cancel: saw_cancel.clone(),
            }),
            &config,
        );
        let id = queue.schedule(swarm("slow"), "u", false).await.unwrap();

        let started = std::time::Instant::now();
        worker.process_one().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(saw_cancel.load(std::sync::atomic::Ordering::SeqCst));

        let task = queue.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("timed out after 20ms"));
    }

    #[tokio::test]
    async fn test_spawned_worker_drains_queue_and_stops() {
        let (queue, worker) = setup(0, 1_000);
        let id = queue.schedule(swarm("fine"), "u", false).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = Arc::new(worker).spawn(shutdown.clone());

        for _ in 0..100 {
            if queue.get_statuses(&[id]).await.unwrap()[0] == Some(TaskStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().status, TaskStatus::Completed);
    }
}
