use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

use super::actions::{render_template, ActionRegistry};
use super::{
    ExecutionStrategy, PerformanceTracker, StrategyContext, StrategyExecutionResult, StrategyType,
};
use crate::core::config::StrategiesConfig;
use crate::core::error::EngineResult;
use crate::navigation::StepInfo;
use crate::reasoning::{extract_json, ReasoningRequest, ReasoningService};
use crate::resources::ResourcePool;

/// What the model may answer on each turn
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Turn {
    ToolCall {
        tool: String,
        #[serde(default)]
        input: Map<String, Value>,
    },
    Final {
        #[serde(rename = "final")]
        answer: Value,
    },
}

/// Multi-turn exchange in which the model may call actions as tools.
///
/// Each turn the model replies with `{"tool": name, "input": {...}}` or
/// `{"final": ...}`; a reply that is not JSON is taken as the final answer.
/// The loop gives up after `strategies.max_tool_iterations` tool calls.
pub struct ConversationalStrategy {
    service: Arc<dyn ReasoningService>,
    actions: Arc<ActionRegistry>,
    max_tool_iterations: usize,
    credits_per_call: u64,
    default_confidence: f64,
    tracker: PerformanceTracker,
}

impl ConversationalStrategy {
    pub fn new(
        service: Arc<dyn ReasoningService>,
        actions: Arc<ActionRegistry>,
        config: &StrategiesConfig,
    ) -> Self {
        Self {
            service,
            actions,
            max_tool_iterations: config.max_tool_iterations,
            credits_per_call: config.credits_per_reasoning_call,
            default_confidence: config.default_confidence,
            tracker: PerformanceTracker::default(),
        }
    }

    fn allowed_tools(&self, config: &Value) -> Vec<(String, String)> {
        let allowed: Option<Vec<&str>> = config
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|items| items.iter().filter_map(|i| i.as_str()).collect());
        self.actions
            .describe()
            .into_iter()
            .filter(|(name, _)| {
                allowed
                    .as_ref()
                    .map(|names| names.contains(&name.as_str()))
                    .unwrap_or(true)
            })
            .collect()
    }

    fn system_prompt(tools: &[(String, String)]) -> String {
        let listing = tools
            .iter()
            .map(|(name, description)| format!("- {}: {}", name, description))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "You complete one step of a routine. Tools:\n{}\n\
             Reply with {{\"tool\": name, \"input\": {{...}}}} to call a tool, \
             or {{\"final\": answer}} when done.",
            listing
        )
    }
}

#[async_trait]
impl ExecutionStrategy for ConversationalStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Conversational
    }

    fn can_handle(&self, step_type: &str, _config: &Value) -> bool {
        matches!(step_type, "conversation" | "conversational" | "chat")
    }

    async fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyExecutionResult> {
        let started = Instant::now();
        let tools = self.allowed_tools(&context.step.config);
        let system = Self::system_prompt(&tools);

        let opening = match context.step.config.get("prompt").and_then(|p| p.as_str()) {
            Some(template) => render_template(template, &context.inputs_value())?,
            None => format!("Complete the step '{}'.", context.step.name),
        };

        let mut transcript = vec![format!("user: {}", opening)];
        let mut calls = 0u64;
        let mut tool_calls = 0usize;
        let mut confidence = self.default_confidence;

        loop {
            let request = ReasoningRequest::new(transcript.join("\n"))
                .with_system(system.clone())
                .with_context(context.inputs_value());
            let response = match self.service.reason(request).await {
                Ok(response) => response,
                // Turns already taken were paid for
                Err(e) if calls > 0 => {
                    warn!(
                        "Step {} lost the reasoning service after {} calls: {}",
                        context.step.node_id, calls, e
                    );
                    return Ok(StrategyExecutionResult::failure(
                        StrategyType::Conversational,
                        e.to_string(),
                    )
                    .with_output(json!({ "transcript": transcript }))
                    .with_usage(ResourcePool::credits(calls * self.credits_per_call).with_steps(1))
                    .with_execution_time(started.elapsed().as_millis() as u64));
                }
                Err(e) => return Err(e),
            };
            calls += 1;
            if let Some(c) = response.confidence {
                confidence = c;
            }
            transcript.push(format!("assistant: {}", response.text));

            let turn = serde_json::from_str::<Turn>(extract_json(&response.text));
            let (tool, input) = match turn {
                Ok(Turn::ToolCall { tool, input }) => (tool, input),
                Ok(Turn::Final { answer }) => {
                    return Ok(self.finish(answer, transcript, calls, tool_calls, confidence, started));
                }
                Err(_) => {
                    return Ok(self.finish(
                        Value::String(response.text),
                        transcript,
                        calls,
                        tool_calls,
                        confidence,
                        started,
                    ));
                }
            };

            if tool_calls >= self.max_tool_iterations {
                warn!(
                    "Step {} exceeded {} tool iterations",
                    context.step.node_id, self.max_tool_iterations
                );
                return Ok(StrategyExecutionResult::failure(
                    StrategyType::Conversational,
                    format!("tool loop exceeded {} iterations", self.max_tool_iterations),
                )
                .with_output(json!({ "transcript": transcript }))
                .with_usage(ResourcePool::credits(calls * self.credits_per_call).with_steps(1))
                .with_execution_time(started.elapsed().as_millis() as u64));
            }
            tool_calls += 1;

            let observation = if tools.iter().any(|(name, _)| name == &tool) {
                debug!("Step {} calls tool '{}'", context.step.node_id, tool);
                match self.actions.run(&tool, &input, &context.blackboard).await {
                    Ok(value) => json!({ "tool": tool, "result": value }),
                    Err(e) => json!({ "tool": tool, "error": e.to_string() }),
                }
            } else {
                json!({ "tool": tool, "error": "tool not available" })
            };
            transcript.push(format!("tool: {}", observation));
        }
    }

    fn estimate_resources(&self, _step: &StepInfo) -> ResourcePool {
        ResourcePool::new(self.credits_per_call * 2, 60_000, 64, 1)
    }

    fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }
}

impl ConversationalStrategy {
    fn finish(
        &self,
        answer: Value,
        transcript: Vec<String>,
        calls: u64,
        tool_calls: usize,
        confidence: f64,
        started: Instant,
    ) -> StrategyExecutionResult {
        StrategyExecutionResult::success(
            StrategyType::Conversational,
            json!({ "answer": answer, "tool_calls": tool_calls, "transcript": transcript }),
            confidence,
        )
        .with_usage(ResourcePool::credits(calls * self.credits_per_call).with_steps(1))
        .with_execution_time(started.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use crate::reasoning::{MockReasoningService, ReasoningResponse};
    use crate::strategies::test_support::context;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reply(text: &str) -> ReasoningResponse {
        ReasoningResponse {
            text: text.to_string(),
            confidence: None,
            tokens_used: 0,
        }
    }

    fn strategy(mock: MockReasoningService, max_tool_iterations: usize) -> ConversationalStrategy {
        let config = StrategiesConfig {
            max_tool_iterations,
            ..StrategiesConfig::default()
        };
        ConversationalStrategy::new(
            Arc::new(mock),
            Arc::new(ActionRegistry::with_builtins()),
            &config,
        )
    }

    #[tokio::test]
    async fn test_tool_call_then_final_answer() {
        let turn = Arc::new(AtomicUsize::new(0));
        let mut mock = MockReasoningService::new();
        mock.expect_reason().times(2).returning(move |req| {
            if turn.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(reply(r#"{"tool": "template", "input": {"template": "Hi {{n}}", "n": "Ada"}}"#))
            } else {
                assert!(req.prompt.contains("Hi Ada"));
                Ok(reply(r#"{"final": "greeted"}"#))
            }
        });

        let result = strategy(mock, 3)
            .execute(&context("conversation", json!({})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["answer"], "greeted");
        assert_eq!(result.output["tool_calls"], 1);
        assert_eq!(result.metadata.resource_usage.credits, 10);
    }

    #[tokio::test]
    async fn test_plain_text_is_final() {
        let mut mock = MockReasoningService::new();
        mock.expect_reason().returning(|_| Ok(reply("all done")));
        let result = strategy(mock, 3)
            .execute(&context("chat", json!({})))
            .await
            .unwrap();
        assert_eq!(result.output["answer"], "all done");
    }

    #[tokio::test]
    async fn test_tool_loop_is_bounded() {
        let mut mock = MockReasoningService::new();
        mock.expect_reason()
            .times(3)
            .returning(|_| Ok(reply(r#"{"tool": "echo", "input": {}}"#)));

        let result = strategy(mock, 2)
            .execute(&context("conversation", json!({})))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("exceeded 2 iterations"));
    }

    #[tokio::test]
    async fn test_service_error_mid_conversation_keeps_usage() {
        let turn = Arc::new(AtomicUsize::new(0));
        let mut mock = MockReasoningService::new();
        mock.expect_reason().times(3).returning(move |_| {
            if turn.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(reply(r#"{"tool": "echo", "input": {}}"#))
            } else {
                Err(EngineError::ReasoningService("connection reset".into()))
            }
        });

        let result = strategy(mock, 5)
            .execute(&context("conversation", json!({})))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("connection reset"));
        assert_eq!(result.metadata.resource_usage.credits, 10);
        assert_eq!(result.metadata.resource_usage.steps, 1);
    }

    #[tokio::test]
    async fn test_service_error_on_first_turn_is_returned() {
        let mut mock = MockReasoningService::new();
        mock.expect_reason()
            .returning(|_| Err(EngineError::ReasoningService("down".into())));
        let err = strategy(mock, 3)
            .execute(&context("conversation", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "reasoning_service");
    }

    #[tokio::test]
    async fn test_disallowed_tool_is_reported_not_run() {
        let turn = Arc::new(AtomicUsize::new(0));
        let mut mock = MockReasoningService::new();
        mock.expect_reason().returning(move |req| {
            if turn.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(reply(r#"{"tool": "set_context", "input": {"key": "x", "value": 1}}"#))
            } else {
                assert!(req.prompt.contains("tool not available"));
                Ok(reply(r#"{"final": "ok"}"#))
            }
        });

        let ctx = context("conversation", json!({"tools": ["echo"]}));
        let result = strategy(mock, 3).execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(ctx.blackboard.get("x").await.unwrap(), None);
    }
}
