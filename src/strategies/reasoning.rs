use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use super::actions::render_template;
use super::{
    ExecutionStrategy, PerformanceTracker, StrategyContext, StrategyExecutionResult, StrategyType,
};
use crate::core::config::StrategiesConfig;
use crate::core::error::EngineResult;
use crate::navigation::StepInfo;
use crate::reasoning::{extract_json, ReasoningRequest, ReasoningService};
use crate::resources::ResourcePool;

/// One reasoning call per step. Also the usual fallback strategy, so it runs
/// any step it is handed even when `can_handle` would have said no.
pub struct ReasoningStrategy {
    service: Arc<dyn ReasoningService>,
    credits_per_call: u64,
    default_confidence: f64,
    tracker: PerformanceTracker,
}

impl ReasoningStrategy {
    pub fn new(service: Arc<dyn ReasoningService>, config: &StrategiesConfig) -> Self {
        Self {
            service,
            credits_per_call: config.credits_per_reasoning_call,
            default_confidence: config.default_confidence,
            tracker: PerformanceTracker::default(),
        }
    }

    fn prompt(context: &StrategyContext) -> EngineResult<String> {
        match context.step.config.get("prompt").and_then(|p| p.as_str()) {
            Some(template) => render_template(template, &context.inputs_value()),
            None => Ok(format!(
                "Carry out the step '{}' of routine '{}' using the provided context.",
                context.step.name, context.routine_id
            )),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for ReasoningStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Reasoning
    }

    fn can_handle(&self, step_type: &str, config: &Value) -> bool {
        matches!(step_type, "reasoning" | "llm" | "think") || config.get("prompt").is_some()
    }

    async fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyExecutionResult> {
        let started = Instant::now();
        let mut request =
            ReasoningRequest::new(Self::prompt(context)?).with_context(context.inputs_value());
        if let Some(system) = context.step.config.get("system").and_then(|s| s.as_str()) {
            request = request.with_system(system);
        }

        let response = self.service.reason(request).await?;

        // A structured reply may ask the swarm to revisit its plan
        let replan = serde_json::from_str::<Value>(extract_json(&response.text))
            .ok()
            .and_then(|v| v.get("replan_requested").and_then(|r| r.as_bool()))
            .unwrap_or(false);

        let confidence = response.confidence.unwrap_or(self.default_confidence);
        let result = StrategyExecutionResult::success(
            StrategyType::Reasoning,
            json!({ "text": response.text, "tokens_used": response.tokens_used }),
            confidence,
        )
        .with_usage(ResourcePool::credits(self.credits_per_call).with_steps(1))
        .with_execution_time(started.elapsed().as_millis() as u64);

        Ok(if replan { result.with_replan() } else { result })
    }

    fn estimate_resources(&self, _step: &StepInfo) -> ResourcePool {
        ResourcePool::new(self.credits_per_call, 30_000, 64, 1)
    }

    fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use crate::reasoning::{MockReasoningService, ReasoningResponse};
    use crate::strategies::test_support::context;

    fn response(text: &str, confidence: Option<f64>) -> ReasoningResponse {
        ReasoningResponse {
            text: text.to_string(),
            confidence,
            tokens_used: 12,
        }
    }

    #[tokio::test]
    async fn test_renders_prompt_and_charges_credits() {
        let mut mock = MockReasoningService::new();
        mock.expect_reason()
            .withf(|req| req.prompt == "Summarise Acme")
            .times(1)
            .returning(|_| Ok(response("summary", Some(0.9))));

        let strategy = ReasoningStrategy::new(Arc::new(mock), &StrategiesConfig::default());
        let ctx = context("reasoning", json!({"prompt": "Summarise {{customer}}"}));
        let result = strategy.execute(&ctx).await.unwrap();

        assert!(result.success);
        assert_eq!(result.output["text"], "summary");
        assert_eq!(result.metadata.confidence, 0.9);
        assert_eq!(result.metadata.resource_usage.credits, 5);
        assert!(!result.feedback.replan_requested);
    }

    #[tokio::test]
    async fn test_structured_reply_can_request_replan() {
        let mut mock = MockReasoningService::new();
        mock.expect_reason()
            .returning(|_| Ok(response("{\"replan_requested\": true}", None)));

        let strategy = ReasoningStrategy::new(Arc::new(mock), &StrategiesConfig::default());
        let result = strategy
            .execute(&context("reasoning", json!({})))
            .await
            .unwrap();
        assert!(result.feedback.replan_requested);
        assert_eq!(result.metadata.confidence, 0.7);
    }

    #[tokio::test]
    async fn test_service_errors_propagate_to_registry() {
        let mut mock = MockReasoningService::new();
        mock.expect_reason()
            .returning(|_| Err(EngineError::ReasoningService("offline".into())));

        let strategy = ReasoningStrategy::new(Arc::new(mock), &StrategiesConfig::default());
        assert!(strategy
            .execute(&context("reasoning", json!({})))
            .await
            .is_err());
    }
}
