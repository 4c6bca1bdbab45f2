use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Weak;
use std::time::Instant;

use super::registry::StrategyRegistry;
use super::{
    ExecutionStrategy, PerformanceTracker, StrategyContext, StrategyExecutionResult, StrategyType,
};
use crate::core::error::{EngineError, EngineResult};
use crate::navigation::flow_graph::EdgeCondition;
use crate::navigation::StepInfo;
use crate::resources::ResourcePool;

/// What a finished sub-routine hands back to the step that started it
#[derive(Debug, Clone, PartialEq)]
pub struct SubroutineResult {
    /// Final variables of the nested run
    pub variables: Value,
    /// Consumed by the nested run, charged to the calling step
    pub usage: ResourcePool,
}

/// Starts another routine from inside a step
#[async_trait]
pub trait SubroutineRunner: Send + Sync {
    async fn run_subroutine(
        &self,
        parent: &StrategyContext,
        routine_id: &str,
        inputs: Map<String, Value>,
    ) -> EngineResult<SubroutineResult>;
}

#[derive(Debug, Clone, Deserialize)]
struct Route {
    #[serde(default)]
    when: Option<EdgeCondition>,
    step_type: String,
    #[serde(default)]
    config: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RoutingConfig {
    #[serde(default)]
    routes: Vec<Route>,
    #[serde(default)]
    subroutine: Option<String>,
    #[serde(default)]
    inputs: Map<String, Value>,
}

/// Delegates a step. With `subroutine` set the named routine is run as a
/// nested run; otherwise the first route whose `when` holds against the step
/// inputs picks the step type the step is re-dispatched as.
pub struct RoutingStrategy {
    registry: Weak<StrategyRegistry>,
    tracker: PerformanceTracker,
}

impl RoutingStrategy {
    pub fn new(registry: Weak<StrategyRegistry>) -> Self {
        Self {
            registry,
            tracker: PerformanceTracker::default(),
        }
    }

    fn parse(context: &StrategyContext) -> EngineResult<RoutingConfig> {
        serde_json::from_value(context.step.config.clone()).map_err(|e| {
            EngineError::Configuration(format!(
                "routing step '{}' has invalid config: {}",
                context.step.node_id, e
            ))
        })
    }

    async fn run_subroutine(
        &self,
        context: &StrategyContext,
        routine_id: &str,
        inputs: Map<String, Value>,
        started: Instant,
    ) -> EngineResult<StrategyExecutionResult> {
        let runner = context.subroutines.as_ref().ok_or_else(|| {
            EngineError::Configuration(format!(
                "step '{}' starts a sub-routine but none can be run here",
                context.step.node_id
            ))
        })?;
        debug!(
            "Step {} starts sub-routine '{}'",
            context.step.node_id, routine_id
        );
        let nested = runner.run_subroutine(context, routine_id, inputs).await?;
        Ok(StrategyExecutionResult::success(
            StrategyType::Routing,
            json!({ "subroutine": routine_id, "result": nested.variables }),
            1.0,
        )
        .with_usage(nested.usage + ResourcePool::default().with_steps(1))
        .with_execution_time(started.elapsed().as_millis() as u64))
    }
}

#[async_trait]
impl ExecutionStrategy for RoutingStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Routing
    }

    fn can_handle(&self, step_type: &str, config: &Value) -> bool {
        matches!(step_type, "routing" | "subroutine")
            || config.get("subroutine").map(|s| s.is_string()).unwrap_or(false)
    }

    async fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyExecutionResult> {
        let started = Instant::now();
        let config = Self::parse(context)?;

        if let Some(routine_id) = &config.subroutine {
            let mut inputs = context.inputs.clone();
            inputs.extend(config.inputs.clone());
            return self.run_subroutine(context, routine_id, inputs, started).await;
        }

        let vars = context.inputs_value();
        let route = config
            .routes
            .iter()
            .find(|r| r.when.as_ref().map(|c| c.evaluate(&vars)).unwrap_or(true))
            .ok_or_else(|| {
                EngineError::StrategyExecution(format!(
                    "no route of step '{}' matches",
                    context.step.node_id
                ))
            })?;

        let registry = self.registry.upgrade().ok_or_else(|| {
            EngineError::Configuration("strategy registry no longer available".into())
        })?;
        let delegate = registry.select(&route.step_type, &route.config)?;
        if delegate.strategy_type() == StrategyType::Routing {
            return Err(EngineError::Configuration(format!(
                "step '{}' routes to another routing step",
                context.step.node_id
            )));
        }

        debug!(
            "Step {} routed to {} ({})",
            context.step.node_id,
            route.step_type,
            delegate.strategy_type()
        );
        let rerouted = context.rerouted(&route.step_type, route.config.clone());
        Ok(registry.execute(&delegate, &rerouted).await)
    }

    fn estimate_resources(&self, step: &StepInfo) -> ResourcePool {
        let Some(registry) = self.registry.upgrade() else {
            return ResourcePool::default().with_steps(1);
        };
        let routes: Vec<Route> = step
            .config
            .get("routes")
            .cloned()
            .and_then(|r| serde_json::from_value(r).ok())
            .unwrap_or_default();

        // Enough for the most expensive branch
        routes
            .iter()
            .filter_map(|r| registry.select(&r.step_type, &r.config).ok())
            .filter(|s| s.strategy_type() != StrategyType::Routing)
            .map(|s| s.estimate_resources(step))
            .fold(ResourcePool::default().with_steps(1), |acc, e| acc.max(&e))
    }

    fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StrategiesConfig;
    use crate::reasoning::OfflineReasoningService;
    use crate::strategies::test_support::context;
    use crate::strategies::ActionRegistry;
    use std::sync::{Arc, Mutex};

    fn registry() -> Arc<StrategyRegistry> {
        StrategyRegistry::standard(
            Arc::new(ActionRegistry::with_builtins()),
            Arc::new(OfflineReasoningService::new()),
            &StrategiesConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_routes_on_inputs() {
        let registry = registry();
        let routing = registry.select("routing", &json!({})).unwrap();
        let ctx = context(
            "routing",
            json!({
                "routes": [
                    {"when": {"key": "customer", "op": "equals", "value": "Globex"},
                     "step_type": "reasoning"},
                    {"when": {"key": "customer", "op": "exists"},
                     "step_type": "action", "config": {"action": "echo"}}
                ]
            }),
        );
        let result = routing.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.metadata.strategy_type, StrategyType::Deterministic);
        assert_eq!(result.output, json!({"customer": "Acme"}));
    }

    #[tokio::test]
    async fn test_no_matching_route_fails() {
        let registry = registry();
        let routing = registry.select("routing", &json!({})).unwrap();
        let ctx = context(
            "routing",
            json!({"routes": [{"when": {"key": "missing", "op": "exists"}, "step_type": "reasoning"}]}),
        );
        assert!(routing.execute(&ctx).await.is_err());
    }

    struct RecordingRunner {
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    #[async_trait]
    impl SubroutineRunner for RecordingRunner {
        async fn run_subroutine(
            &self,
            _parent: &StrategyContext,
            routine_id: &str,
            inputs: Map<String, Value>,
        ) -> EngineResult<SubroutineResult> {
            self.calls
                .lock()
                .unwrap()
                .push((routine_id.to_string(), inputs));
            Ok(SubroutineResult {
                variables: json!({"done": true}),
                usage: ResourcePool::credits(3),
            })
        }
    }

    #[tokio::test]
    async fn test_subroutine_goes_through_runner() {
        let registry = registry();
        let runner = Arc::new(RecordingRunner {
            calls: Mutex::new(Vec::new()),
        });
        let mut ctx = context(
            "routing",
            json!({"subroutine": "child", "inputs": {"depth": 1}}),
        );
        ctx.subroutines = Some(runner.clone() as Arc<dyn SubroutineRunner>);

        let routing = registry.select("routing", &ctx.step.config).unwrap();
        let result = routing.execute(&ctx).await.unwrap();
        assert_eq!(result.output["result"], json!({"done": true}));
        assert_eq!(result.metadata.resource_usage.credits, 3);
        assert_eq!(result.metadata.resource_usage.steps, 1);

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].0, "child");
        assert_eq!(calls[0].1["depth"], 1);
        assert_eq!(calls[0].1["customer"], "Acme");
    }

    #[tokio::test]
    async fn test_subroutine_without_runner_is_configuration_error() {
        let registry = registry();
        let ctx = context("routing", json!({"subroutine": "child"}));
        let routing = registry.select("routing", &ctx.step.config).unwrap();
        assert!(matches!(
            routing.execute(&ctx).await,
            Err(EngineError::Configuration(_))
        ));
    }
}
