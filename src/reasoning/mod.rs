//! Boundary to the language-model backends used for reasoning.
//!
//! The engine only sees [`ReasoningService`]; the HTTP adapter and the
//! offline planner are two implementations of it.

pub mod http;
pub mod offline;
pub mod retry;

pub use http::HttpReasoningService;
pub use offline::OfflineReasoningService;
pub use retry::{with_retry, RetryPolicy};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};

use crate::core::config::ReasoningConfig;
use crate::core::error::{EngineError, EngineResult};

/// One free-form reasoning call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub prompt: String,

    #[serde(default)]
    pub system: Option<String>,

    /// Structured context made available to the model
    #[serde(default)]
    pub context: Value,
}

impl ReasoningRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResponse {
    pub text: String,

    /// Self-reported confidence in [0, 1], when the backend provides one
    #[serde(default)]
    pub confidence: Option<f64>,

    #[serde(default)]
    pub tokens_used: u64,
}

/// Result of situation analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub situation: String,

    #[serde(default)]
    pub opportunities: Vec<String>,

    #[serde(default)]
    pub threats: Vec<String>,
}

/// Strategic decision produced while strategizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    /// Start a run of a catalogued routine
    RunRoutine {
        routine_id: String,
        #[serde(default)]
        inputs: serde_json::Map<String, Value>,
        #[serde(default)]
        rationale: String,
    },

    /// Write a fact to the blackboard
    RecordFact { name: String, value: Value },

    /// The goal is met; nothing further to run
    Complete {
        #[serde(default)]
        summary: String,
    },
}

/// Opaque reasoning backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn reason(&self, request: ReasoningRequest) -> EngineResult<ReasoningResponse>;

    /// `context` carries blackboard facts and the routines on offer
    async fn analyze_situation(&self, goal: &str, context: &Value) -> EngineResult<Orientation>;

    async fn generate_decisions(
        &self,
        goal: &str,
        orientation: &Orientation,
        context: &Value,
    ) -> EngineResult<Vec<Decision>>;
}

/// Build the service named by `reasoning.provider`
pub fn create_service(config: &ReasoningConfig) -> EngineResult<Arc<dyn ReasoningService>> {
    match config.provider.as_str() {
        "offline" => Ok(Arc::new(OfflineReasoningService::new())),
        "http" | "openai" => Ok(Arc::new(HttpReasoningService::from_config(config)?)),
        other => Err(EngineError::Configuration(format!(
            "unknown reasoning provider '{}'",
            other
        ))),
    }
}

/// Extract JSON from a response that may be wrapped in markdown code blocks.
pub fn extract_json(response: &str) -> &str {
    use regex::Regex;

    static JSON_BLOCK_RE: OnceLock<Regex> = OnceLock::new();
    let re = JSON_BLOCK_RE.get_or_init(|| {
        Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)\n?```").expect("static regex")
    });

    if let Some(captures) = re.captures(response) {
        if let Some(json_match) = captures.get(1) {
            return json_match.as_str().trim();
        }
    }

    response.trim()
}

/// Parse a model response into `T`, tolerating code fences
pub fn parse_json_response<T: serde::de::DeserializeOwned>(response: &str) -> EngineResult<T> {
    serde_json::from_str(extract_json(response)).map_err(|e| {
        EngineError::ReasoningService(format!("malformed response: {}", e))
    })
}
