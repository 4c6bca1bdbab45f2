// File: tests/swarm_lifecycle.rs
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use swarm_engine::context::{ContextStore, InMemoryContextStore, SwarmContext};
use swarm_engine::core::{Config, EngineResult};
use swarm_engine::database::{HistoryRecord, InMemoryHistoryLog, InMemoryRoutineCatalog};
use swarm_engine::events::{BroadcastEventSink, SwarmEventKind};
use swarm_engine::navigation::Routine;
use swarm_engine::orchestration::RunStatus;
use swarm_engine::queue::{
    InMemoryTaskLockManager, InMemoryTaskQueue, QueueWorker, TaskPayload, TaskQueue, TaskStatus,
};
use swarm_engine::reasoning::OfflineReasoningService;
use swarm_engine::resources::AllocationStatus;
use swarm_engine::strategies::{ActionRegistry, StepAction, StrategyType};
use swarm_engine::swarm::{Swarm, SwarmCoordinator, SwarmReport, SwarmState};

/// Signals when it starts, then takes a while to finish
struct SlowAction {
    started: Arc<Notify>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl StepAction for SlowAction {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleeps before answering"
    }

    async fn run(&self, _inputs: &Map<String, Value>, _context: &SwarmContext) -> EngineResult<Value> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(json!({"slept": true}))
    }
}

struct Setup {
    coordinator: Arc<SwarmCoordinator>,
    history: Arc<InMemoryHistoryLog>,
    store: Arc<InMemoryContextStore>,
    sink: Arc<BroadcastEventSink>,
}

fn setup(actions: ActionRegistry, routines: Vec<Routine>) -> Setup {
    setup_with(&Config::for_testing(), actions, routines)
}

fn setup_with(config: &Config, actions: ActionRegistry, routines: Vec<Routine>) -> Setup {
    let history = Arc::new(InMemoryHistoryLog::new());
    let store = Arc::new(InMemoryContextStore::new());
    let sink = Arc::new(BroadcastEventSink::new(256));
    let coordinator = SwarmCoordinator::build(
        config,
        Arc::new(OfflineReasoningService::new()),
        actions,
        Arc::new(InMemoryRoutineCatalog::with_routines(routines)),
        history.clone(),
        store.clone(),
        sink.clone(),
    );
    Setup {
        coordinator,
        history,
        store,
        sink,
    }
}

fn slow_routine() -> Routine {
    Routine::new(
        "slow-then-echo",
        "Slow then echo",
        json!({"steps": [
            {"id": "slow", "type": "action", "config": {"action": "slow"}},
            {"id": "after", "type": "action", "config": {"action": "echo"}}
        ]}),
    )
}

async fn step_records(history: &InMemoryHistoryLog) -> Vec<swarm_engine::database::StepRecord> {
    history
        .all()
        .await
        .into_iter()
        .filter_map(|r| match r {
            HistoryRecord::Step(step) => Some(step),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_cancel_mid_step_finishes_step_and_releases_leases() {
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    let mut actions = ActionRegistry::with_builtins();
    actions.register(SlowAction {
        started: started.clone(),
        finished: finished.clone(),
    });
    let s = setup(actions, vec![slow_routine()]);

    let swarm = Swarm::new("sleep on it", "tester", s.coordinator.default_swarm_config());
    let swarm_id = swarm.id.clone();
    let handle = s.coordinator.clone().spawn_swarm(swarm).await;

    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("slow step never started");
    let pool = s.coordinator.allocator().swarm_pool(&swarm_id).await.unwrap();
    s.coordinator.cancel_swarm(&swarm_id).await.unwrap();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.final_state, SwarmState::Cancelled);
    assert!(finished.load(Ordering::SeqCst), "in-flight step was cut short");

    let steps = step_records(&s.history).await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].node_id, "slow");
    assert!(steps[0].success);
    assert_eq!(report.runs.len(), 1);
    assert_eq!(report.runs[0].status, RunStatus::Cancelled);

    let allocator = s.coordinator.allocator();
    let settled = allocator.get(pool.id).await.unwrap();
    assert_ne!(settled.status, AllocationStatus::Active);
    for run in allocator.children(pool.id).await.unwrap() {
        assert_ne!(run.status, AllocationStatus::Active);
        for step in allocator.children(run.id).await.unwrap() {
            assert_ne!(step.status, AllocationStatus::Active);
        }
    }
    assert!(s.coordinator.active_swarms().await.is_empty());
    assert!(s.coordinator.cancel_swarm(&swarm_id).await.is_err());
}

#[tokio::test]
async fn test_missing_action_falls_back_to_reasoning() {
    let routine = Routine::new(
        "draft",
        "Draft",
        json!({"steps": [
            {"id": "compose", "type": "action", "config": {"action": "not_installed"}},
            {"id": "confirm", "type": "action", "config": {"action": "echo"}}
        ]}),
    );
    let s = setup(ActionRegistry::with_builtins(), vec![routine]);

    let report = s
        .coordinator
        .run_swarm(Swarm::new("draft a note", "tester", s.coordinator.default_swarm_config()))
        .await
        .unwrap();

    assert_eq!(report.final_state, SwarmState::Completed);
    assert_eq!(report.runs[0].status, RunStatus::Completed);
    assert!(report
        .issues
        .iter()
        .any(|issue| issue.starts_with("draft:")));

    let steps = step_records(&s.history).await;
    let compose = steps.iter().find(|s| s.node_id == "compose").unwrap();
    assert!(compose.fallback_used);
    assert_eq!(compose.strategy_type, Some(StrategyType::Reasoning));
    let confirm = steps.iter().find(|s| s.node_id == "confirm").unwrap();
    assert!(!confirm.fallback_used);
    assert_eq!(confirm.strategy_type, Some(StrategyType::Deterministic));
}

#[tokio::test]
async fn test_queued_task_drives_swarm_and_reports_on_channel() {
    let routine = Routine::new(
        "greet",
        "Greet",
        json!({"steps": [{"id": "hello", "type": "action",
                          "config": {"action": "template",
                                     "inputs": {"template": "Hello {{name}}", "name": "Acme"}}}]}),
    );
    let s = setup(ActionRegistry::with_builtins(), vec![routine]);
    let mut events = s.sink.subscribe();

    let config = Config::for_testing();
    let queue = Arc::new(InMemoryTaskQueue::new(
        Arc::new(InMemoryTaskLockManager::new()),
        config.queue.clone(),
    ));
    let task_id = queue
        .schedule(
            TaskPayload::Swarm {
                goal: "greet Acme".into(),
                channel_id: Some("chan-1".into()),
            },
            "tester",
            true,
        )
        .await
        .unwrap();
    let worker = QueueWorker::new("worker-1", queue.clone(), s.coordinator.clone(), &config.queue);

    assert_eq!(worker.process_one().await.unwrap(), Some(task_id));
    assert_eq!(worker.process_one().await.unwrap(), None);

    let task = queue.get(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let report: SwarmReport = serde_json::from_value(task.result.unwrap()).unwrap();
    assert_eq!(report.final_state, SwarmState::Completed);
    assert_eq!(report.runs[0].variables["hello"]["text"], "Hello Acme");

    let audit = queue.audit_log(task_id).await.unwrap();
    assert_eq!(audit.last().map(|c| c.to), Some(TaskStatus::Completed));

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.channel_id, "chan-1");
        if event.kind == SwarmEventKind::StateUpdate {
            states.push(event.payload["state"].as_str().unwrap_or_default().to_string());
        }
    }
    assert_eq!(states.first().map(String::as_str), Some("initializing"));
    assert_eq!(states.last().map(String::as_str), Some("completed"));
    assert!(states.iter().any(|s| s == "executing"));
}

#[tokio::test]
async fn test_queue_timeout_cancels_swarm_and_settles_its_leases() {
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    let mut actions = ActionRegistry::with_builtins();
    actions.register(SlowAction {
        started: started.clone(),
        finished: finished.clone(),
    });
    let mut config = Config::for_testing();
    config.queue.task_timeout_ms = 150;
    config.queue.cancel_grace_ms = 5_000;
    let s = setup_with(&config, actions, vec![slow_routine()]);

    let queue = Arc::new(InMemoryTaskQueue::new(
        Arc::new(InMemoryTaskLockManager::new()),
        config.queue.clone(),
    ));
    let task_id = queue
        .schedule(
            TaskPayload::Swarm {
                goal: "sleep on it".into(),
                channel_id: None,
            },
            "tester",
            false,
        )
        .await
        .unwrap();
    let worker = QueueWorker::new("worker-1", queue.clone(), s.coordinator.clone(), &config.queue);
    assert_eq!(worker.process_one().await.unwrap(), Some(task_id));

    let task = queue.get(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("timed out after 150ms"));
    assert!(finished.load(Ordering::SeqCst), "in-flight step was cut short");

    // The swarm reviewed and settled before the worker gave up on the task
    assert!(s.coordinator.active_swarms().await.is_empty());
    let review = s
        .history
        .all()
        .await
        .into_iter()
        .find_map(|r| match r {
            HistoryRecord::Review(review) => Some(review),
            _ => None,
        })
        .expect("swarm was never reviewed");
    assert_eq!(review.final_state, SwarmState::Cancelled);
    assert_eq!(step_records(&s.history).await.len(), 1);

    assert!(s.coordinator.allocator().swarm_pool(&review.swarm_id).await.is_err());
    let record = s.store.get_swarm(&review.swarm_id).await.unwrap().unwrap();
    assert_eq!(record.state, SwarmState::Cancelled);
    assert!(s.coordinator.cancel_swarm(&review.swarm_id).await.is_err());
}
