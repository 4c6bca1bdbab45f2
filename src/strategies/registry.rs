use futures::FutureExt;
use log::{error, warn};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use super::actions::ActionRegistry;
use super::{
    ConversationalStrategy, DeterministicStrategy, ExecutionStrategy, Performance,
    ReasoningStrategy, RoutingStrategy, StrategyContext, StrategyExecutionResult, StrategyType,
};
use crate::core::config::StrategiesConfig;
use crate::core::error::{EngineError, EngineResult};
use crate::reasoning::ReasoningService;

/// Ordered list of strategies; the first that can handle a step wins
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn ExecutionStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic, Routing, Conversational, Reasoning, in that order
    pub fn standard(
        actions: Arc<ActionRegistry>,
        reasoning: Arc<dyn ReasoningService>,
        config: &StrategiesConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|registry| {
            let mut strategies = Self::new();
            strategies.register(Arc::new(DeterministicStrategy::new(actions.clone())));
            strategies.register(Arc::new(RoutingStrategy::new(registry.clone())));
            strategies.register(Arc::new(ConversationalStrategy::new(
                reasoning.clone(),
                actions.clone(),
                config,
            )));
            strategies.register(Arc::new(ReasoningStrategy::new(reasoning, config)));
            strategies
        })
    }

    pub fn register(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn select(
        &self,
        step_type: &str,
        config: &serde_json::Value,
    ) -> EngineResult<Arc<dyn ExecutionStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.can_handle(step_type, config))
            .cloned()
            .ok_or_else(|| {
                EngineError::Configuration(format!("no strategy handles step type '{}'", step_type))
            })
    }

    pub fn by_type(&self, strategy_type: StrategyType) -> Option<Arc<dyn ExecutionStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.strategy_type() == strategy_type)
            .cloned()
    }

    /// Strategy designated by name, e.g. `orchestrator.fallback_strategy`
    pub fn by_name(&self, name: &str) -> EngineResult<Arc<dyn ExecutionStrategy>> {
        let strategy_type: StrategyType = name.parse()?;
        self.by_type(strategy_type).ok_or_else(|| {
            EngineError::Configuration(format!("strategy '{}' is not registered", name))
        })
    }

    /// Run a strategy so that neither errors nor panics escape: both come
    /// back as failure results. Performance counters are updated here.
    pub async fn execute(
        &self,
        strategy: &Arc<dyn ExecutionStrategy>,
        context: &StrategyContext,
    ) -> StrategyExecutionResult {
        let strategy_type = strategy.strategy_type();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(strategy.execute(context))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(
                    "{} strategy failed on step {}: {}",
                    strategy_type, context.step.node_id, e
                );
                StrategyExecutionResult::failure(strategy_type, e.to_string())
                    .with_execution_time(elapsed)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    "{} strategy panicked on step {}: {}",
                    strategy_type, context.step.node_id, message
                );
                StrategyExecutionResult::failure(
                    strategy_type,
                    format!("strategy panicked: {}", message),
                )
                .with_execution_time(elapsed)
            }
        };

        strategy.tracker().record(&result);
        result
    }

    pub fn metrics(&self) -> Vec<(StrategyType, Performance)> {
        self.strategies
            .iter()
            .map(|s| (s.strategy_type(), s.performance_metrics()))
            .collect()
    }

    pub fn types(&self) -> Vec<StrategyType> {
        self.strategies.iter().map(|s| s.strategy_type()).collect()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
