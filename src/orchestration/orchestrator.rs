use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::run::{Run, RunOutcome, RunStatus};
use crate::context::SwarmContext;
use crate::core::config::OrchestratorConfig;
use crate::core::error::{EngineError, EngineResult};
use crate::database::{HistoryLog, HistoryRecord, RoutineCatalog, RunRecord, StepRecord};
use crate::navigation::{Navigator, NavigatorRegistry, Routine, StepInfo};
use crate::resources::{Allocation, AllocationRequest, ResourceAllocator, ResourcePool};
use crate::strategies::{
    ExecutionFeedback, ExecutionStrategy, Outcome, StrategyContext, StrategyExecutionResult,
    StrategyRegistry, SubroutineResult, SubroutineRunner,
};

/// Routines may start sub-routines this many levels deep
pub const MAX_NESTING_DEPTH: u32 = 4;

/// Per-run parameters that do not come from the routine itself
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overlaid on the routine's default inputs
    pub inputs: Map<String, Value>,
    pub cancel: CancellationToken,
    pub depth: u32,
}

impl RunOptions {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }
}

enum StepOutcome {
    Completed,
    Failed,
    Exhausted,
    /// The run lease was frozen by cancellation before the step could start
    Stopped,
}

/// Tier two: walks one routine step by step.
///
/// Each step gets its own lease from the run lease, runs under a deadline
/// equal to the lease's lifetime and is released with what it actually used.
/// A failed step is retried once with the fallback strategy. Cancellation is
/// observed between steps only, so an in-flight step always finishes.
pub struct TierTwoOrchestrator {
    navigators: NavigatorRegistry,
    strategies: Arc<StrategyRegistry>,
    allocator: Arc<ResourceAllocator>,
    catalog: Arc<dyn RoutineCatalog>,
    history: Arc<dyn HistoryLog>,
    config: OrchestratorConfig,
    me: Weak<TierTwoOrchestrator>,
}

impl TierTwoOrchestrator {
    pub fn new(
        navigators: NavigatorRegistry,
        strategies: Arc<StrategyRegistry>,
        allocator: Arc<ResourceAllocator>,
        catalog: Arc<dyn RoutineCatalog>,
        history: Arc<dyn HistoryLog>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            navigators,
            strategies,
            allocator,
            catalog,
            history,
            config,
            me: me.clone(),
        })
    }

    pub fn strategies(&self) -> &Arc<StrategyRegistry> {
        &self.strategies
    }

    pub fn catalog(&self) -> &Arc<dyn RoutineCatalog> {
        &self.catalog
    }

    /// Drive `routine` to an end location, a failure, exhaustion or
    /// cancellation. Only non-recoverable errors are returned as `Err`;
    /// everything else ends up in the outcome's status and issues.
    pub async fn run_routine(
        &self,
        blackboard: &SwarmContext,
        routine: &Routine,
        run_allocation: &Allocation,
        options: RunOptions,
    ) -> EngineResult<RunOutcome> {
        let navigator = self.navigators.select(routine)?;

        let mut variables = routine.inputs.clone();
        variables.extend(options.inputs.clone());
        let mut run = Run::new(
            run_allocation.owner_id.clone(),
            blackboard.swarm_id(),
            &routine.id,
            variables,
        );
        run.transition(RunStatus::Running)?;
        info!(
            "Run {} of routine '{}' started ({} navigator, depth {})",
            run.id,
            routine.id,
            navigator.name(),
            options.depth
        );

        let driven = self
            .drive(navigator, blackboard, routine, run_allocation, &options, &mut run)
            .await;

        let fatal = match driven {
            Ok(status) => {
                run.transition(status)?;
                None
            }
            Err(e) => {
                run.issues.push(format!("{}: {}", e.kind(), e));
                run.transition(RunStatus::Failed)?;
                if e.is_recoverable() {
                    None
                } else {
                    Some(e)
                }
            }
        };

        info!(
            "Run {} finished {} after {} steps",
            run.id, run.status, run.steps_executed
        );
        self.append_history(HistoryRecord::Run(RunRecord {
            swarm_id: run.swarm_id.clone(),
            run_id: run.id.clone(),
            routine_id: run.routine_id.clone(),
            status: run.status,
            steps_executed: run.steps_executed,
            issues: run.issues.clone(),
            finished_at: Utc::now(),
        }))
        .await;

        match fatal {
            Some(e) => Err(e),
            None => Ok(run.outcome()),
        }
    }

    async fn drive(
        &self,
        navigator: &dyn Navigator,
        blackboard: &SwarmContext,
        routine: &Routine,
        run_allocation: &Allocation,
        options: &RunOptions,
        run: &mut Run,
    ) -> EngineResult<RunStatus> {
        let mut location = navigator.start_location(routine, &run.id)?;
        loop {
            run.location = Some(location.clone());
            if navigator.is_end_location(routine, &location)? {
                return Ok(RunStatus::Completed);
            }
            if options.cancel.is_cancelled() {
                info!("Run {} cancelled before node '{}'", run.id, location.node_id);
                return Ok(RunStatus::Cancelled);
            }
            if run.steps_executed >= self.config.max_steps_per_run {
                run.issues.push(format!(
                    "step limit of {} reached at node '{}'",
                    self.config.max_steps_per_run, location.node_id
                ));
                return Ok(RunStatus::Failed);
            }

            let step = navigator.step_info(routine, &location)?;
            if step.executable {
                let outcome = self
                    .execute_step(blackboard, run, run_allocation, &step, options)
                    .await?;
                match outcome {
                    StepOutcome::Completed => {}
                    StepOutcome::Failed => return Ok(RunStatus::Failed),
                    StepOutcome::Exhausted => return Ok(RunStatus::Exhausted),
                    StepOutcome::Stopped => return Ok(RunStatus::Cancelled),
                }
            }

            let context = run.context_value();
            let mut candidates = navigator.next_locations(routine, &location, Some(&context))?;
            location = match candidates.len() {
                0 => {
                    run.issues
                        .push(format!("no way forward from node '{}'", location.node_id));
                    return Ok(RunStatus::Failed);
                }
                1 => candidates.remove(0),
                _ => {
                    return Err(EngineError::AmbiguousBranch {
                        node_id: location.node_id.clone(),
                        candidates: candidates.into_iter().map(|l| l.node_id).collect(),
                    })
                }
            };
        }
    }

    async fn execute_step(
        &self,
        blackboard: &SwarmContext,
        run: &mut Run,
        run_allocation: &Allocation,
        step: &StepInfo,
        options: &RunOptions,
    ) -> EngineResult<StepOutcome> {
        let strategy = self.strategies.select(&step.step_type, &step.config)?;
        let estimate = strategy.estimate_resources(step);
        let request = AllocationRequest::new(
            format!("{}:{}", run.id, step.node_id),
            estimate,
            self.config.step_duration_ms,
        )
        .with_reservation(estimate.max(&self.config.step_reservation));

        let lease = match self.allocator.allocate_for_step(run_allocation.id, request).await {
            Ok(lease) => lease,
            Err(EngineError::ResourceExhausted(msg)) => {
                warn!("Run {} exhausted at step '{}': {}", run.id, step.node_id, msg);
                run.issues.push(format!("resource_exhausted: {}", msg));
                return Ok(StepOutcome::Exhausted);
            }
            Err(EngineError::NotEligible(msg)) if options.cancel.is_cancelled() => {
                debug!("Run {} lease frozen, not starting '{}': {}", run.id, step.node_id, msg);
                return Ok(StepOutcome::Stopped);
            }
            Err(e) => return Err(e),
        };

        let mut inputs = run.variables.clone();
        if let Some(Value::Object(step_inputs)) = step.config.get("inputs") {
            inputs.extend(step_inputs.clone());
        }
        let context = StrategyContext {
            swarm_id: run.swarm_id.clone(),
            run_id: run.id.clone(),
            routine_id: run.routine_id.clone(),
            step: step.clone(),
            inputs,
            blackboard: blackboard.clone(),
            allocation_id: lease.id,
            budget: lease.allocated,
            cancel: options.cancel.clone(),
            depth: options.depth,
            subroutines: self
                .me
                .upgrade()
                .map(|me| me as Arc<dyn SubroutineRunner>),
        };

        let primary = self.execute_bounded(&strategy, &context, &lease).await;
        let mut usage = primary.metadata.resource_usage;
        let result = if primary.success {
            primary
        } else {
            match self.fallback_for(&primary)? {
                Some(fallback) => {
                    info!(
                        "Step '{}' failed with {}, falling back to {}",
                        step.node_id,
                        primary.metadata.strategy_type,
                        fallback.strategy_type()
                    );
                    let second = self
                        .execute_bounded(&fallback, &context, &lease)
                        .await
                        .as_fallback();
                    usage = usage + second.metadata.resource_usage;
                    merge_fallback(primary, second)
                }
                None => primary,
            }
        };

        match self.allocator.release(lease.id, usage).await {
            Ok(_) => {}
            Err(e @ EngineError::AllocationConsistency(_)) => return Err(e),
            Err(e) => warn!("Could not release step lease {}: {}", lease.id, e),
        }

        run.usage = run.usage + usage;
        run.steps_executed += 1;
        blackboard.add_progress("steps_executed", 1).await?;
        self.append_history(HistoryRecord::Step(StepRecord {
            swarm_id: run.swarm_id.clone(),
            run_id: run.id.clone(),
            routine_id: run.routine_id.clone(),
            node_id: step.node_id.clone(),
            step_type: step.step_type.clone(),
            strategy_type: Some(result.metadata.strategy_type),
            success: result.success,
            fallback_used: result.metadata.fallback_used,
            error: result.error.clone(),
            issues: result.feedback.issues.clone(),
            usage,
            confidence: result.metadata.confidence,
            execution_time_ms: result.metadata.execution_time_ms,
            recorded_at: Utc::now(),
        }))
        .await;

        if !result.success {
            run.issues.extend(result.feedback.issues);
            blackboard.add_progress("steps_failed", 1).await?;
            return Ok(StepOutcome::Failed);
        }

        run.issues.extend(result.feedback.issues.iter().cloned());
        if result.feedback.replan_requested {
            run.replan_requested = true;
        }
        blackboard
            .record_step_output(&run.id, &step.node_id, result.output.clone())
            .await?;
        run.variables.insert(step.node_id.clone(), result.output);
        Ok(StepOutcome::Completed)
    }

    /// The designated fallback, unless it is the strategy that just failed
    fn fallback_for(
        &self,
        failed: &StrategyExecutionResult,
    ) -> EngineResult<Option<Arc<dyn ExecutionStrategy>>> {
        let fallback = self.strategies.by_name(&self.config.fallback_strategy)?;
        if fallback.strategy_type() == failed.metadata.strategy_type {
            Ok(None)
        } else {
            Ok(Some(fallback))
        }
    }

    async fn execute_bounded(
        &self,
        strategy: &Arc<dyn ExecutionStrategy>,
        context: &StrategyContext,
        lease: &Allocation,
    ) -> StrategyExecutionResult {
        let budget_ms = lease.time_left_ms(Utc::now()).max(1);
        match timeout(
            Duration::from_millis(budget_ms),
            self.strategies.execute(strategy, context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Step '{}' exceeded its {}ms deadline",
                    context.step.node_id, budget_ms
                );
                // What the strategy spent is unknown; charge its estimate
                // and the time it held the lease
                let charged = strategy
                    .estimate_resources(&context.step)
                    .max(&ResourcePool::default().with_time_ms(budget_ms));
                let result = StrategyExecutionResult::failure(
                    strategy.strategy_type(),
                    format!(
                        "step '{}' exceeded its {}ms deadline",
                        context.step.node_id, budget_ms
                    ),
                )
                .with_usage(charged)
                .with_execution_time(budget_ms);
                strategy.tracker().record(&result);
                result
            }
        }
    }

    async fn append_history(&self, record: HistoryRecord) {
        if let Err(e) = self.history.append(record).await {
            error!("Failed to append run history: {}", e);
        }
    }
}

/// Fallback result carrying the primary attempt's issues first
fn merge_fallback(
    primary: StrategyExecutionResult,
    fallback: StrategyExecutionResult,
) -> StrategyExecutionResult {
    let mut issues = primary.feedback.issues;
    issues.extend(fallback.feedback.issues.iter().cloned());
    StrategyExecutionResult {
        feedback: ExecutionFeedback {
            outcome: if fallback.success {
                Outcome::Partial
            } else {
                fallback.feedback.outcome
            },
            issues,
            ..fallback.feedback
        },
        ..fallback
    }
}

#[async_trait]
impl SubroutineRunner for TierTwoOrchestrator {
    async fn run_subroutine(
        &self,
        parent: &StrategyContext,
        routine_id: &str,
        inputs: Map<String, Value>,
    ) -> EngineResult<SubroutineResult> {
        if parent.depth + 1 > MAX_NESTING_DEPTH {
            return Err(EngineError::Configuration(format!(
                "sub-routine '{}' would nest deeper than {} levels",
                routine_id, MAX_NESTING_DEPTH
            )));
        }

        let routine = self.catalog.get(routine_id).await?;
        let request = AllocationRequest::new(
            format!("{}>{}", parent.run_id, routine_id),
            ResourcePool::default().with_steps(1),
            self.config.step_duration_ms,
        )
        .with_reservation(parent.budget);
        let lease = self
            .allocator
            .allocate_nested_run(parent.allocation_id, request)
            .await?;

        let options = RunOptions {
            inputs,
            cancel: parent.cancel.child_token(),
            depth: parent.depth + 1,
        };
        let outcome = self
            .run_routine(&parent.blackboard, &routine, &lease, options)
            .await;

        let usage = outcome.as_ref().map(|o| o.usage).unwrap_or_default();
        self.allocator.release(lease.id, usage).await?;
        let outcome = outcome?;

        match outcome.status {
            RunStatus::Completed => Ok(SubroutineResult {
                variables: Value::Object(outcome.variables),
                usage,
            }),
            RunStatus::Cancelled => Err(EngineError::Cancelled(format!(
                "sub-routine '{}' cancelled",
                routine_id
            ))),
            RunStatus::Exhausted => Err(EngineError::ResourceExhausted(format!(
                "sub-routine '{}' ran out of resources",
                routine_id
            ))),
            status => Err(EngineError::StrategyExecution(format!(
                "sub-routine '{}' {}: {}",
                routine_id,
                status,
                outcome.issues.join("; ")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryContextStore;
    use crate::core::config::{AllocatorConfig, Config};
    use crate::database::{InMemoryHistoryLog, InMemoryRoutineCatalog};
    use crate::reasoning::{MockReasoningService, OfflineReasoningService, ReasoningService};
    use crate::resources::InMemoryAllocationStore;
    use crate::strategies::ActionRegistry;
    use serde_json::json;

    struct Harness {
        orchestrator: Arc<TierTwoOrchestrator>,
        allocator: Arc<ResourceAllocator>,
        history: Arc<InMemoryHistoryLog>,
        blackboard: SwarmContext,
    }

    fn harness(reasoning: Arc<dyn ReasoningService>, routines: Vec<Routine>) -> Harness {
        harness_with(
            Config::for_testing(),
            ActionRegistry::with_builtins(),
            reasoning,
            routines,
        )
    }

    fn harness_with(
        config: Config,
        actions: ActionRegistry,
        reasoning: Arc<dyn ReasoningService>,
        routines: Vec<Routine>,
    ) -> Harness {
        let allocator = Arc::new(ResourceAllocator::new(
            Arc::new(InMemoryAllocationStore::new()),
            &AllocatorConfig::default(),
        ));
        let history = Arc::new(InMemoryHistoryLog::new());
        let strategies =
            StrategyRegistry::standard(Arc::new(actions), reasoning, &config.strategies);
        let orchestrator = TierTwoOrchestrator::new(
            NavigatorRegistry::default(),
            strategies,
            allocator.clone(),
            Arc::new(InMemoryRoutineCatalog::with_routines(routines)),
            history.clone(),
            config.orchestrator,
        );
        Harness {
            orchestrator,
            allocator,
            history,
            blackboard: SwarmContext::new(Arc::new(InMemoryContextStore::new()), "swarm-1"),
        }
    }

    async fn run_lease(allocator: &ResourceAllocator, steps: u64) -> Allocation {
        allocator
            .open_swarm_pool("swarm-1", ResourcePool::new(1_000, 3_600_000, 4_096, 100), 3_600_000)
            .await
            .unwrap();
        let budget = ResourcePool::new(200, 900_000, 1_024, steps);
        allocator
            .allocate_for_run(
                "swarm-1",
                AllocationRequest::new("run-1", budget, 600_000).with_reservation(budget),
            )
            .await
            .unwrap()
    }

    fn greeting_routine() -> Routine {
        Routine::new(
            "greet",
            "Greet",
            json!({"steps": [
                {"id": "hello", "type": "action",
                 "config": {"action": "template", "inputs": {"template": "Hello {{customer}}"}}},
                {"id": "copy", "type": "action", "config": {"action": "echo"}}
            ]}),
        )
    }

    fn inputs() -> Map<String, Value> {
        json!({"customer": "Acme"}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_sequential_routine_completes_and_records_outputs() {
        let h = harness(Arc::new(OfflineReasoningService::new()), vec![]);
        let lease = run_lease(&h.allocator, 10).await;

        let outcome = h
            .orchestrator
            .run_routine(
                &h.blackboard,
                &greeting_routine(),
                &lease,
                RunOptions::new(CancellationToken::new()).with_inputs(inputs()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.steps_executed, 2);
        assert_eq!(outcome.variables["hello"]["text"], json!("Hello Acme"));
        assert_eq!(h.blackboard.progress("steps_executed").await.unwrap(), 2);
        assert_eq!(
            h.blackboard.step_output("run-1", "hello").await.unwrap(),
            Some(json!({"text": "Hello Acme"}))
        );

        // Every step lease went back to the run lease
        assert!(h.allocator.children(lease.id).await.unwrap().is_empty());
        let records = h.history.all().await;
        assert_eq!(records.len(), 3);
        assert!(matches!(records[2], HistoryRecord::Run(ref r) if r.status == RunStatus::Completed));
    }

    #[tokio::test]
    async fn test_failed_step_falls_back_once_and_succeeds() {
        let h = harness(Arc::new(OfflineReasoningService::new()), vec![]);
        let lease = run_lease(&h.allocator, 10).await;
        let routine = Routine::new(
            "broken",
            "Broken",
            json!({"steps": [{"id": "s1", "type": "action", "config": {"action": "missing"}}]}),
        );

        let outcome = h
            .orchestrator
            .run_routine(&h.blackboard, &routine, &lease, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.issues.len(), 1);
        let step = h
            .history
            .all()
            .await
            .into_iter()
            .find_map(|r| match r {
                HistoryRecord::Step(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert!(step.fallback_used);
        assert_eq!(step.strategy_type, Some(crate::strategies::StrategyType::Reasoning));
    }

    struct Stall;

    #[async_trait]
    impl crate::strategies::StepAction for Stall {
        fn name(&self) -> &str {
            "stall"
        }

        fn description(&self) -> &str {
            "Never answers in time"
        }

        async fn run(&self, _inputs: &Map<String, Value>, _context: &SwarmContext) -> EngineResult<Value> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_step_past_deadline_is_charged_its_estimate() {
        let mut config = Config::for_testing();
        config.orchestrator.step_duration_ms = 50;
        config.orchestrator.fallback_strategy = "deterministic".into();
        let mut actions = ActionRegistry::with_builtins();
        actions.register(Stall);
        let h = harness_with(config, actions, Arc::new(OfflineReasoningService::new()), vec![]);
        let lease = run_lease(&h.allocator, 10).await;
        let routine = Routine::new(
            "stuck",
            "Stuck",
            json!({"steps": [{"id": "wait", "type": "action", "config": {"action": "stall"}}]}),
        );

        let outcome = h
            .orchestrator
            .run_routine(&h.blackboard, &routine, &lease, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        let step = h
            .history
            .all()
            .await
            .into_iter()
            .find_map(|r| match r {
                HistoryRecord::Step(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert!(!step.success);
        assert!(step.error.unwrap().contains("deadline"));
        // Deterministic estimate: 1s of time, 16MB, one step
        assert_eq!(step.usage, ResourcePool::new(0, 1_000, 16, 1));
        assert_eq!(outcome.usage.steps, 1);
    }

    #[tokio::test]
    async fn test_failed_fallback_fails_run_with_both_issues() {
        let mut mock = MockReasoningService::new();
        mock.expect_reason()
            .times(1)
            .returning(|_| Err(EngineError::ReasoningService("model offline".into())));
        let h = harness(Arc::new(mock), vec![]);
        let lease = run_lease(&h.allocator, 10).await;
        let routine = Routine::new(
            "broken",
            "Broken",
            json!({"steps": [
                {"id": "s1", "type": "action", "config": {"action": "missing"}},
                {"id": "s2", "type": "action", "config": {"action": "echo"}}
            ]}),
        );

        let outcome = h
            .orchestrator
            .run_routine(&h.blackboard, &routine, &lease, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.steps_executed, 1);
        assert_eq!(outcome.issues.len(), 2);
        assert!(outcome.issues[1].contains("model offline"));
        assert_eq!(h.blackboard.progress("steps_failed").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_lease_out_of_steps_exhausts_run() {
        let h = harness(Arc::new(OfflineReasoningService::new()), vec![]);
        let lease = run_lease(&h.allocator, 1).await;

        let outcome = h
            .orchestrator
            .run_routine(
                &h.blackboard,
                &greeting_routine(),
                &lease,
                RunOptions::default().with_inputs(inputs()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Exhausted);
        assert_eq!(outcome.steps_executed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_executes_nothing() {
        let h = harness(Arc::new(OfflineReasoningService::new()), vec![]);
        let lease = run_lease(&h.allocator, 10).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h
            .orchestrator
            .run_routine(&h.blackboard, &greeting_routine(), &lease, RunOptions::new(cancel))
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.steps_executed, 0);
    }

    #[tokio::test]
    async fn test_ambiguous_branch_fails_run() {
        let h = harness(Arc::new(OfflineReasoningService::new()), vec![]);
        let lease = run_lease(&h.allocator, 10).await;
        let routine = Routine::new(
            "fork",
            "Fork",
            json!({
                "nodes": [
                    {"id": "start", "type": "start"},
                    {"id": "a", "type": "task", "step_type": "action", "config": {"action": "echo"}},
                    {"id": "b", "type": "task", "step_type": "action", "config": {"action": "echo"}},
                    {"id": "end", "type": "end"}
                ],
                "edges": [
                    {"from": "start", "to": "a"},
                    {"from": "start", "to": "b"},
                    {"from": "a", "to": "end"},
                    {"from": "b", "to": "end"}
                ]
            }),
        );

        let outcome = h
            .orchestrator
            .run_routine(&h.blackboard, &routine, &lease, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.issues[0].starts_with("ambiguous_branch"));
    }

    #[tokio::test]
    async fn test_subroutine_runs_nested_and_charges_parent_step() {
        let child = Routine::new(
            "child",
            "Child",
            json!({"steps": [{"id": "inner", "type": "action",
                              "config": {"action": "template", "inputs": {"template": "for {{customer}}"}}}]}),
        );
        let h = harness(Arc::new(OfflineReasoningService::new()), vec![child]);
        let lease = run_lease(&h.allocator, 10).await;
        let parent = Routine::new(
            "parent",
            "Parent",
            json!({"steps": [{"id": "call", "type": "routing", "config": {"subroutine": "child"}}]}),
        );

        let outcome = h
            .orchestrator
            .run_routine(
                &h.blackboard,
                &parent,
                &lease,
                RunOptions::default().with_inputs(inputs()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.variables["call"]["result"]["inner"]["text"], json!("for Acme"));
        // One step for the nested task, one for the routing step itself
        assert_eq!(outcome.usage.steps, 2);
        assert!(h.allocator.children(lease.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_graph_shape_is_configuration_error() {
        let h = harness(Arc::new(OfflineReasoningService::new()), vec![]);
        let lease = run_lease(&h.allocator, 10).await;
        let routine = Routine::new("odd", "Odd", json!({"states": {}}));
        let result = h
            .orchestrator
            .run_routine(&h.blackboard, &routine, &lease, RunOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
