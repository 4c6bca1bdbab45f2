//! Tier one: drives a swarm from its goal to a terminal state.
//!
//! The coordinator analyzes the situation, asks the reasoning service for
//! decisions and hands routine runs to Tier Two, re-planning when a run asks
//! for it or when the adaptation interval passes with work still queued.
//! Every swarm passes through `Reviewing` exactly once on its way out.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::{Swarm, SwarmConfig, SwarmState};
use crate::context::{ContextStore, SwarmContext, SwarmRecord};
use crate::core::config::{AllocatorConfig, Config, ReasoningConfig, SwarmDefaults};
use crate::core::error::{EngineError, EngineResult};
use crate::database::{HistoryLog, HistoryRecord, ReviewRecord, RoutineCatalog};
use crate::events::{EventEmitter, EventSink};
use crate::navigation::NavigatorRegistry;
use crate::orchestration::{RunOptions, RunOutcome, RunStatus, TierTwoOrchestrator};
use crate::queue::{QueuedTask, TaskHandler, TaskPayload};
use crate::reasoning::{with_retry, Decision, Orientation, ReasoningService, RetryPolicy};
use crate::resources::{Allocation, AllocationRequest, InMemoryAllocationStore, ResourceAllocator};
use crate::strategies::{ActionRegistry, StrategyRegistry};

/// What a swarm achieved, returned once it reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmReport {
    pub swarm_id: String,
    pub goal: String,
    pub final_state: SwarmState,
    pub replans: u32,
    pub runs: Vec<RunOutcome>,
    pub issues: Vec<String>,
    pub summary: Option<String>,
}

/// Mutable state of one swarm while it is being driven
struct SwarmExecution {
    swarm: Swarm,
    blackboard: SwarmContext,
    cancel: CancellationToken,
    pool: Option<Allocation>,
    orientation: Option<Orientation>,
    pending: Vec<Decision>,
    completed_routines: Vec<String>,
    runs: Vec<RunOutcome>,
    runs_failed: u64,
    issues: Vec<String>,
    replans: u32,
    summary: Option<String>,
}

enum Verdict {
    /// A `Complete` decision was reached
    Done,
    /// Every decision was carried out but none said the goal is met
    OutOfDecisions,
    Replan,
    Cancelled,
    Fatal(EngineError),
}

pub struct SwarmCoordinator {
    reasoning: Arc<dyn ReasoningService>,
    orchestrator: Arc<TierTwoOrchestrator>,
    allocator: Arc<ResourceAllocator>,
    context_store: Arc<dyn ContextStore>,
    history: Arc<dyn HistoryLog>,
    events: Arc<EventEmitter>,
    swarm_defaults: SwarmDefaults,
    allocator_config: AllocatorConfig,
    reasoning_config: ReasoningConfig,
    active: Mutex<HashMap<String, CancellationToken>>,
}

/// Keeps a swarm listed as active for as long as its driver is alive,
/// including when the driving future is dropped before it finishes.
struct ActiveEntry<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    swarm_id: String,
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        let token = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.swarm_id);
        if let Some(token) = token {
            // Anything still holding the token stops at its next check
            token.cancel();
        }
    }
}

impl SwarmCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        reasoning: Arc<dyn ReasoningService>,
        orchestrator: Arc<TierTwoOrchestrator>,
        allocator: Arc<ResourceAllocator>,
        context_store: Arc<dyn ContextStore>,
        history: Arc<dyn HistoryLog>,
        events: Arc<EventEmitter>,
    ) -> Self {
        Self {
            reasoning,
            orchestrator,
            allocator,
            context_store,
            history,
            events,
            swarm_defaults: config.swarm.clone(),
            allocator_config: config.allocator.clone(),
            reasoning_config: config.reasoning.clone(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Wire up the three tiers with the bundled in-memory allocation store
    pub fn build(
        config: &Config,
        reasoning: Arc<dyn ReasoningService>,
        actions: ActionRegistry,
        catalog: Arc<dyn RoutineCatalog>,
        history: Arc<dyn HistoryLog>,
        context_store: Arc<dyn ContextStore>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let allocator = Arc::new(ResourceAllocator::new(
            Arc::new(InMemoryAllocationStore::new()),
            &config.allocator,
        ));
        let strategies =
            StrategyRegistry::standard(Arc::new(actions), reasoning.clone(), &config.strategies);
        let orchestrator = TierTwoOrchestrator::new(
            NavigatorRegistry::default(),
            strategies,
            allocator.clone(),
            catalog,
            history.clone(),
            config.orchestrator.clone(),
        );
        let events = Arc::new(EventEmitter::new(
            Some(context_store.clone()),
            sink,
            config.events.cache_capacity,
        ));
        Arc::new(Self::new(
            config,
            reasoning,
            orchestrator,
            allocator,
            context_store,
            history,
            events,
        ))
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn orchestrator(&self) -> &Arc<TierTwoOrchestrator> {
        &self.orchestrator
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    /// Configuration for a new swarm built from the configured defaults
    pub fn default_swarm_config(&self) -> SwarmConfig {
        SwarmConfig::from(&self.swarm_defaults)
    }

    fn token_for(&self, swarm_id: &str) -> CancellationToken {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(swarm_id.to_string())
            .or_default()
            .clone()
    }

    /// List `swarm_id` as active under a token that also fires with `parent`
    fn register_child(&self, swarm_id: &str, parent: &CancellationToken) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(swarm_id.to_string(), parent.child_token());
    }

    pub async fn active_swarms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Ask a swarm to stop. Runs finish their in-flight step, then the swarm
    /// reviews and ends `Cancelled`.
    pub async fn cancel_swarm(&self, swarm_id: &str) -> EngineResult<()> {
        let token = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(swarm_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("active swarm {}", swarm_id)))?;
        info!("Cancelling swarm {}", swarm_id);
        token.cancel();
        Ok(())
    }

    /// Drive `swarm` on its own task. The swarm is cancellable as soon as
    /// this returns.
    pub async fn spawn_swarm(
        self: Arc<Self>,
        swarm: Swarm,
    ) -> tokio::task::JoinHandle<EngineResult<SwarmReport>> {
        self.token_for(&swarm.id);
        tokio::spawn(async move { self.run_swarm(swarm).await })
    }

    /// Drive `swarm` to a terminal state
    pub async fn run_swarm(&self, swarm: Swarm) -> EngineResult<SwarmReport> {
        let cancel = self.token_for(&swarm.id);
        let _entry = ActiveEntry {
            active: &self.active,
            swarm_id: swarm.id.clone(),
        };
        let blackboard = SwarmContext::new(self.context_store.clone(), swarm.id.clone());
        info!("Swarm {} starting: {}", swarm.id, swarm.goal);

        let mut exec = SwarmExecution {
            swarm,
            blackboard,
            cancel,
            pool: None,
            orientation: None,
            pending: Vec::new(),
            completed_routines: Vec::new(),
            runs: Vec::new(),
            runs_failed: 0,
            issues: Vec::new(),
            replans: 0,
            summary: None,
        };
        self.persist(&exec, None).await;

        let end = self.drive(&mut exec).await;
        self.review(&mut exec, end).await
    }

    async fn drive(&self, exec: &mut SwarmExecution) -> SwarmState {
        if let Err(e) = self.initialize(exec).await {
            exec.issues.push(format!("{}: {}", e.kind(), e));
            return SwarmState::Failed;
        }

        let mut next = SwarmState::Analyzing;
        loop {
            if exec.cancel.is_cancelled() {
                return SwarmState::Cancelled;
            }
            if let Err(e) = self.transition(exec, next).await {
                exec.issues.push(format!("{}: {}", e.kind(), e));
                return SwarmState::Failed;
            }

            next = match next {
                SwarmState::Analyzing => match self.analyze(exec).await {
                    Ok(()) => SwarmState::Strategizing,
                    Err(e) => {
                        exec.issues.push(format!("analysis: {}", e));
                        return SwarmState::Failed;
                    }
                },
                SwarmState::Strategizing => match self.strategize(exec).await {
                    Ok(()) => SwarmState::Executing,
                    Err(e) => {
                        exec.issues.push(format!("strategy: {}", e));
                        return SwarmState::Failed;
                    }
                },
                SwarmState::Executing => match self.execute(exec).await {
                    Verdict::Done => return Self::settled_state(exec),
                    Verdict::Replan => {
                        exec.replans += 1;
                        info!("Swarm {} re-planning ({})", exec.swarm.id, exec.replans);
                        SwarmState::Strategizing
                    }
                    Verdict::OutOfDecisions if exec.replans < exec.swarm.config.max_replans => {
                        exec.replans += 1;
                        SwarmState::Strategizing
                    }
                    Verdict::OutOfDecisions => return Self::settled_state(exec),
                    Verdict::Cancelled => return SwarmState::Cancelled,
                    Verdict::Fatal(e) => {
                        error!("Swarm {} hit a fatal error: {}", exec.swarm.id, e);
                        exec.issues.push(format!("{}: {}", e.kind(), e));
                        return SwarmState::Failed;
                    }
                },
                other => {
                    exec.issues.push(format!("no work defined for state {}", other));
                    return SwarmState::Failed;
                }
            };
        }
    }

    /// A swarm whose every run failed did not achieve anything
    fn settled_state(exec: &SwarmExecution) -> SwarmState {
        let completed = exec
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .count();
        if completed == 0 && exec.runs_failed > 0 {
            SwarmState::Failed
        } else {
            SwarmState::Completed
        }
    }

    async fn initialize(&self, exec: &mut SwarmExecution) -> EngineResult<()> {
        let config = &exec.swarm.config;
        let pool = self
            .allocator
            .open_swarm_pool(&exec.swarm.id, config.pool, config.pool_duration_ms)
            .await?;
        self.events
            .emit_swarm_config_update(&exec.swarm.id, config, None)
            .await;
        self.events
            .emit_swarm_resource_update(&exec.swarm.id, &pool, None)
            .await;
        exec.blackboard.set("goal", json!(exec.swarm.goal)).await?;
        exec.pool = Some(pool);
        Ok(())
    }

    async fn transition(&self, exec: &mut SwarmExecution, next: SwarmState) -> EngineResult<()> {
        let previous = exec.swarm.state;
        exec.swarm.state = previous.transition(next)?;
        info!("Swarm {}: {} -> {}", exec.swarm.id, previous, next);
        self.persist(exec, Some(format!("{} -> {}", previous, next)))
            .await;
        Ok(())
    }

    async fn persist(&self, exec: &SwarmExecution, message: Option<String>) {
        let record = SwarmRecord {
            swarm_id: exec.swarm.id.clone(),
            state: exec.swarm.state,
            goal: exec.swarm.goal.clone(),
            channel_id: exec.swarm.channel_id.clone(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.context_store.put_swarm(record).await {
            warn!("Failed to persist swarm {}: {}", exec.swarm.id, e);
        }
        self.events
            .emit_swarm_state_update(&exec.swarm.id, exec.swarm.state, message, None)
            .await;
    }

    fn retry_policy(&self, exec: &SwarmExecution) -> RetryPolicy {
        RetryPolicy::from_config(&self.reasoning_config, exec.swarm.config.decision_timeout_ms)
    }

    async fn reasoning_context(&self, exec: &SwarmExecution) -> EngineResult<Value> {
        let routines = self.orchestrator.catalog().list().await?;
        Ok(json!({
            "swarm_id": exec.swarm.id,
            "routines": routines,
            "completed_routines": exec.completed_routines,
            "issues": exec.issues,
            "replans": exec.replans,
        }))
    }

    async fn analyze(&self, exec: &mut SwarmExecution) -> EngineResult<()> {
        let context = self.reasoning_context(exec).await?;
        let goal = exec.swarm.goal.clone();
        let orientation = with_retry(&self.retry_policy(exec), "analyze_situation", || {
            self.reasoning.analyze_situation(&goal, &context)
        })
        .await?;
        debug!(
            "Swarm {} orientation: {} opportunities, {} threats",
            exec.swarm.id,
            orientation.opportunities.len(),
            orientation.threats.len()
        );
        exec.blackboard.put("orientation", &orientation).await?;
        exec.orientation = Some(orientation);
        Ok(())
    }

    async fn strategize(&self, exec: &mut SwarmExecution) -> EngineResult<()> {
        let context = self.reasoning_context(exec).await?;
        let goal = exec.swarm.goal.clone();
        let orientation = exec.orientation.clone().unwrap_or_default();
        let decisions = with_retry(&self.retry_policy(exec), "generate_decisions", || {
            self.reasoning
                .generate_decisions(&goal, &orientation, &context)
        })
        .await?;
        info!(
            "Swarm {} planned {} decisions",
            exec.swarm.id,
            decisions.len()
        );
        exec.blackboard.put("decisions", &decisions).await?;
        exec.pending = decisions;
        Ok(())
    }

    async fn execute(&self, exec: &mut SwarmExecution) -> Verdict {
        let config = exec.swarm.config.clone();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        let adapt_at = Instant::now() + Duration::from_millis(config.adaptation_interval_ms);
        let cancel = exec.cancel.clone();

        let mut pending: VecDeque<Decision> = std::mem::take(&mut exec.pending).into();
        let mut running: JoinSet<(String, EngineResult<RunOutcome>)> = JoinSet::new();
        let mut stopping = false;
        let mut saw_complete = false;
        let mut replan = false;
        let mut cancelled = false;
        let mut fatal: Option<EngineError> = None;

        loop {
            if cancel.is_cancelled() && !cancelled {
                cancelled = true;
                stopping = true;
                self.freeze_pool(exec).await;
            }

            while !stopping {
                let Some(decision) = pending.front().cloned() else {
                    break;
                };
                match decision {
                    Decision::RecordFact { name, value } => {
                        pending.pop_front();
                        if let Err(e) = exec.blackboard.record_fact(&name, value).await {
                            exec.issues.push(format!("fact '{}' not recorded: {}", name, e));
                        }
                    }
                    Decision::Complete { summary } => {
                        pending.clear();
                        saw_complete = true;
                        exec.summary = Some(summary);
                    }
                    Decision::RunRoutine {
                        routine_id, inputs, ..
                    } => {
                        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                            break;
                        };
                        pending.pop_front();
                        self.spawn_run(exec, &mut running, routine_id, inputs, permit);
                    }
                }
            }

            if running.is_empty() {
                break;
            }

            let can_adapt = !stopping
                && !pending.is_empty()
                && exec.replans < config.max_replans;
            tokio::select! {
                joined = running.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (routine_id, result) = match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            exec.runs_failed += 1;
                            exec.issues.push(format!("run task aborted: {}", e));
                            continue;
                        }
                    };
                    match self.record_run(exec, &routine_id, result).await {
                        Ok(wants_replan) => {
                            if wants_replan && exec.replans < config.max_replans && !stopping {
                                replan = true;
                                stopping = true;
                            }
                        }
                        Err(e) => {
                            fatal = Some(e);
                            stopping = true;
                            cancel.cancel();
                        }
                    }
                }
                _ = cancel.cancelled(), if !stopping => {}
                _ = tokio::time::sleep_until(adapt_at), if can_adapt => {
                    info!(
                        "Swarm {} adaptation interval elapsed with {} decisions queued",
                        exec.swarm.id,
                        pending.len()
                    );
                    replan = true;
                    stopping = true;
                }
            }
        }

        if let Some(e) = fatal {
            return Verdict::Fatal(e);
        }
        if cancelled {
            return Verdict::Cancelled;
        }
        if replan {
            return Verdict::Replan;
        }
        if saw_complete {
            Verdict::Done
        } else {
            Verdict::OutOfDecisions
        }
    }

    fn spawn_run(
        &self,
        exec: &SwarmExecution,
        running: &mut JoinSet<(String, EngineResult<RunOutcome>)>,
        routine_id: String,
        inputs: Map<String, Value>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let orchestrator = self.orchestrator.clone();
        let allocator = self.allocator.clone();
        let blackboard = exec.blackboard.clone();
        let request = AllocationRequest::new(
            format!("{}/run-{}", exec.swarm.id, Uuid::new_v4()),
            self.allocator_config.run_estimate,
            self.allocator_config.run_duration_ms,
        )
        .with_reservation(self.allocator_config.run_reservation);
        let options = RunOptions::new(exec.cancel.clone()).with_inputs(inputs);

        debug!("Swarm {} starting routine '{}'", exec.swarm.id, routine_id);
        running.spawn(async move {
            let _permit = permit;
            let result = run_one(
                orchestrator,
                allocator,
                blackboard,
                request,
                &routine_id,
                options,
            )
            .await;
            (routine_id, result)
        });
    }

    /// Fold a finished run into the swarm. Returns whether it asked for a
    /// re-plan; non-recoverable errors are handed back.
    async fn record_run(
        &self,
        exec: &mut SwarmExecution,
        routine_id: &str,
        result: EngineResult<RunOutcome>,
    ) -> EngineResult<bool> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if !e.is_recoverable() => return Err(e),
            Err(EngineError::NotEligible(_)) if exec.cancel.is_cancelled() => {
                debug!("Routine '{}' not started, swarm is cancelling", routine_id);
                return Ok(false);
            }
            Err(e) => {
                exec.runs_failed += 1;
                exec.issues
                    .push(format!("routine '{}' not run: {}", routine_id, e));
                exec.blackboard.add_progress("runs_failed", 1).await?;
                return Ok(false);
            }
        };

        info!(
            "Swarm {} routine '{}' ended {}",
            exec.swarm.id, routine_id, outcome.status
        );
        match outcome.status {
            RunStatus::Completed => {
                exec.completed_routines.push(routine_id.to_string());
                exec.blackboard.add_progress("runs_completed", 1).await?;
            }
            RunStatus::Cancelled => {}
            _ => {
                exec.runs_failed += 1;
                exec.blackboard.add_progress("runs_failed", 1).await?;
            }
        }
        exec.issues.extend(
            outcome
                .issues
                .iter()
                .map(|issue| format!("{}: {}", routine_id, issue)),
        );

        if let Some(pool) = &exec.pool {
            if let Ok(pool) = self.allocator.get(pool.id).await {
                self.events
                    .emit_swarm_resource_update(&exec.swarm.id, &pool, None)
                    .await;
            }
        }

        let wants_replan = outcome.replan_requested;
        exec.runs.push(outcome);
        Ok(wants_replan)
    }

    async fn freeze_pool(&self, exec: &SwarmExecution) {
        if let Some(pool) = &exec.pool {
            if let Err(e) = self.allocator.freeze(pool.id).await {
                warn!("Could not freeze pool of swarm {}: {}", exec.swarm.id, e);
            }
        }
    }

    async fn review(&self, exec: &mut SwarmExecution, end: SwarmState) -> EngineResult<SwarmReport> {
        self.transition(exec, SwarmState::Reviewing).await?;

        if let Some(pool) = &exec.pool {
            match self.allocator.release_tree(pool.id).await {
                Ok(_) => {
                    if let Ok(settled) = self.allocator.get(pool.id).await {
                        self.events
                            .emit_swarm_resource_update(&exec.swarm.id, &settled, None)
                            .await;
                    }
                }
                Err(e) => {
                    error!("Releasing leases of swarm {} failed: {}", exec.swarm.id, e);
                    exec.issues.push(format!("{}: {}", e.kind(), e));
                }
            }
        }

        let runs_completed = exec
            .runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .count() as u64;
        let review = ReviewRecord {
            swarm_id: exec.swarm.id.clone(),
            goal: exec.swarm.goal.clone(),
            final_state: end,
            runs_completed,
            runs_failed: exec.runs_failed,
            replans: exec.replans,
            issues: exec.issues.clone(),
            strategy_metrics: self.orchestrator.strategies().metrics(),
            reviewed_at: Utc::now(),
        };
        if let Err(e) = exec.blackboard.put("review", &review).await {
            warn!("Failed to store review of swarm {}: {}", exec.swarm.id, e);
        }
        if let Err(e) = self.history.append(HistoryRecord::Review(review)).await {
            error!("Failed to append review of swarm {}: {}", exec.swarm.id, e);
        }

        self.transition(exec, end).await?;
        info!(
            "Swarm {} finished {} ({} runs, {} replans)",
            exec.swarm.id,
            end,
            exec.runs.len(),
            exec.replans
        );

        Ok(SwarmReport {
            swarm_id: exec.swarm.id.clone(),
            goal: exec.swarm.goal.clone(),
            final_state: end,
            replans: exec.replans,
            runs: std::mem::take(&mut exec.runs),
            issues: std::mem::take(&mut exec.issues),
            summary: exec.summary.take(),
        })
    }
}

async fn run_one(
    orchestrator: Arc<TierTwoOrchestrator>,
    allocator: Arc<ResourceAllocator>,
    blackboard: SwarmContext,
    request: AllocationRequest,
    routine_id: &str,
    options: RunOptions,
) -> EngineResult<RunOutcome> {
    let routine = orchestrator.catalog().get(routine_id).await?;
    let lease = allocator
        .allocate_for_run(blackboard.swarm_id(), request)
        .await?;
    let outcome = orchestrator
        .run_routine(&blackboard, &routine, &lease, options)
        .await;
    let usage = outcome.as_ref().map(|o| o.usage).unwrap_or_default();
    allocator.release(lease.id, usage).await?;
    outcome
}

#[async_trait]
impl TaskHandler for SwarmCoordinator {
    /// A cancelled task cancels its swarm, which still reviews and releases
    /// its leases before the report comes back.
    async fn handle(&self, task: &QueuedTask, cancel: CancellationToken) -> EngineResult<Value> {
        match &task.payload {
            TaskPayload::Swarm { goal, channel_id } => {
                let mut swarm = Swarm::new(
                    goal.clone(),
                    task.requester_id.clone(),
                    self.default_swarm_config(),
                );
                swarm.channel_id = channel_id.clone();
                self.register_child(&swarm.id, &cancel);
                let report = self.run_swarm(swarm).await?;
                Ok(serde_json::to_value(report)?)
            }
        }
    }
}

static COORDINATOR: RwLock<Option<Arc<SwarmCoordinator>>> = RwLock::new(None);

/// Install the process-wide coordinator. Fails if one is already installed.
pub fn init(coordinator: Arc<SwarmCoordinator>) -> EngineResult<Arc<SwarmCoordinator>> {
    let mut slot = COORDINATOR.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(EngineError::Configuration(
            "coordinator already initialised".into(),
        ));
    }
    *slot = Some(coordinator.clone());
    Ok(coordinator)
}

/// The process-wide coordinator
pub fn instance() -> EngineResult<Arc<SwarmCoordinator>> {
    COORDINATOR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(|| EngineError::Configuration("coordinator not initialised".into()))
}

/// Remove the process-wide coordinator, returning it
pub fn reset() -> Option<Arc<SwarmCoordinator>> {
    COORDINATOR
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
}
