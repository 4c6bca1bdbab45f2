use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

use super::{
    parse_json_response, Decision, Orientation, ReasoningRequest, ReasoningResponse,
    ReasoningService,
};
use crate::core::config::ReasoningConfig;
use crate::core::error::{EngineError, EngineResult};

const ANALYZE_SYSTEM: &str = "You orient an autonomous agent swarm. Reply with a JSON object \
{\"situation\": string, \"opportunities\": [string], \"threats\": [string]} and nothing else.";

const DECIDE_SYSTEM: &str = "You plan for an autonomous agent swarm. Reply with a JSON object \
{\"decisions\": [...]} where each decision is one of \
{\"action\": \"run_routine\", \"routine_id\": string, \"inputs\": object, \"rationale\": string}, \
{\"action\": \"record_fact\", \"name\": string, \"value\": any}, \
{\"action\": \"complete\", \"summary\": string}. Only use routine ids listed in the context.";

/// Reasoning over an OpenAI-compatible `/chat/completions` endpoint
pub struct HttpReasoningService {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: usize,
    temperature: f32,
}

#[derive(serde::Deserialize)]
struct DecisionList {
    #[serde(default)]
    decisions: Vec<Decision>,
}

impl HttpReasoningService {
    pub fn from_config(cfg: &ReasoningConfig) -> EngineResult<Self> {
        // Prefer explicit api_key if present, else env OPENAI_API_KEY
        let api_key = match &cfg.api_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => std::env::var("OPENAI_API_KEY").map_err(|_| {
                EngineError::Configuration("missing reasoning.api_key or OPENAI_API_KEY".into())
            })?,
        };

        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| {
                EngineError::Configuration(format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            api_key,
            api_base: cfg.api_base.clone(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn map_messages(req: &ReasoningRequest) -> Vec<JsonValue> {
        let mut msgs = Vec::new();
        if let Some(sys) = &req.system {
            msgs.push(json!({"role": "system", "content": sys}));
        }
        let content = if req.context.is_null() {
            req.prompt.clone()
        } else {
            format!("{}\n\nContext:\n{}", req.prompt, req.context)
        };
        msgs.push(json!({"role": "user", "content": content}));
        msgs
    }

    fn parse_completion(body: &JsonValue) -> EngineResult<ReasoningResponse> {
        let text = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                EngineError::ReasoningService("completion without message content".into())
            })?
            .to_string();
        let tokens_used = body
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);
        Ok(ReasoningResponse {
            text,
            confidence: None,
            tokens_used,
        })
    }
}

#[async_trait]
impl ReasoningService for HttpReasoningService {
    async fn reason(&self, request: ReasoningRequest) -> EngineResult<ReasoningResponse> {
        let body = json!({
            "model": self.model,
            "messages": Self::map_messages(&request),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        debug!("Reasoning request to {} ({})", self.api_base, self.model);
        let response = self
            .client
            .post(self.build_url("chat/completions"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ReasoningService(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::ReasoningService(format!(
                "HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }

        let json: JsonValue = response
            .json()
            .await
            .map_err(|e| EngineError::ReasoningService(format!("invalid response body: {}", e)))?;
        Self::parse_completion(&json)
    }

    async fn analyze_situation(&self, goal: &str, context: &JsonValue) -> EngineResult<Orientation> {
        let request = ReasoningRequest::new(format!("Goal: {}", goal))
            .with_system(ANALYZE_SYSTEM)
            .with_context(context.clone());
        let response = self.reason(request).await?;
        parse_json_response(&response.text)
    }

    async fn generate_decisions(
        &self,
        goal: &str,
        orientation: &Orientation,
        context: &JsonValue,
    ) -> EngineResult<Vec<Decision>> {
        let request = ReasoningRequest::new(format!(
            "Goal: {}\nOrientation: {}",
            goal,
            serde_json::to_string(orientation)?
        ))
        .with_system(DECIDE_SYSTEM)
        .with_context(context.clone());
        let response = self.reason(request).await?;
        let list: DecisionList = parse_json_response(&response.text)?;
        Ok(list.decisions)
    }
}
