use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use super::actions::ActionRegistry;
use super::{
    ExecutionStrategy, PerformanceTracker, StrategyContext, StrategyExecutionResult, StrategyType,
};
use crate::core::error::{EngineError, EngineResult};
use crate::navigation::StepInfo;
use crate::resources::ResourcePool;

/// Runs a named [`StepAction`](super::StepAction). Handles steps typed
/// `action` or `deterministic` whose config names an `action`.
pub struct DeterministicStrategy {
    actions: Arc<ActionRegistry>,
    tracker: PerformanceTracker,
}

impl DeterministicStrategy {
    pub fn new(actions: Arc<ActionRegistry>) -> Self {
        Self {
            actions,
            tracker: PerformanceTracker::default(),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for DeterministicStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Deterministic
    }

    fn can_handle(&self, step_type: &str, config: &Value) -> bool {
        matches!(step_type, "action" | "deterministic")
            && config.get("action").map(|a| a.is_string()).unwrap_or(false)
    }

    async fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyExecutionResult> {
        let started = Instant::now();
        let name = context
            .step
            .config
            .get("action")
            .and_then(|a| a.as_str())
            .ok_or_else(|| {
                EngineError::StrategyExecution(format!(
                    "step '{}' does not name an action",
                    context.step.node_id
                ))
            })?;

        debug!("Running action '{}' for step {}", name, context.step.node_id);
        let output = self
            .actions
            .run(name, &context.inputs, &context.blackboard)
            .await?;

        Ok(
            StrategyExecutionResult::success(StrategyType::Deterministic, output, 1.0)
                .with_usage(ResourcePool::default().with_steps(1))
                .with_execution_time(started.elapsed().as_millis() as u64),
        )
    }

    fn estimate_resources(&self, _step: &StepInfo) -> ResourcePool {
        ResourcePool::new(0, 1_000, 16, 1)
    }

    fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }
}
