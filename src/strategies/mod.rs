//! Tier three: how a single step is carried out.
//!
//! Strategies are tried in declaration order and the first whose
//! [`ExecutionStrategy::can_handle`] accepts the step wins. Whatever happens
//! inside a strategy, the caller receives a [`StrategyExecutionResult`]; see
//! [`StrategyRegistry::execute`].

pub mod actions;
pub mod conversational;
pub mod deterministic;
pub mod reasoning;
pub mod registry;
pub mod routing;

pub use actions::{ActionRegistry, StepAction};
pub use conversational::ConversationalStrategy;
pub use deterministic::DeterministicStrategy;
pub use reasoning::ReasoningStrategy;
pub use registry::StrategyRegistry;
pub use routing::{RoutingStrategy, SubroutineResult, SubroutineRunner};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::context::SwarmContext;
use crate::core::error::{EngineError, EngineResult};
use crate::navigation::StepInfo;
use crate::resources::{AllocationId, ResourcePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Deterministic,
    Routing,
    Conversational,
    Reasoning,
}

impl StrategyType {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyType::Deterministic => "deterministic",
            StrategyType::Routing => "routing",
            StrategyType::Conversational => "conversational",
            StrategyType::Reasoning => "reasoning",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deterministic" => Ok(StrategyType::Deterministic),
            "routing" => Ok(StrategyType::Routing),
            "conversational" => Ok(StrategyType::Conversational),
            "reasoning" => Ok(StrategyType::Reasoning),
            other => Err(EngineError::Configuration(format!(
                "unknown strategy '{}'",
                other
            ))),
        }
    }
}

/// Everything a strategy may look at while executing one step
#[derive(Clone)]
pub struct StrategyContext {
    pub swarm_id: String,
    pub run_id: String,
    pub routine_id: String,
    pub step: StepInfo,
    /// Run variables overlaid with the step's own `inputs`
    pub inputs: serde_json::Map<String, Value>,
    pub blackboard: SwarmContext,
    /// Step lease the execution is charged to
    pub allocation_id: AllocationId,
    pub budget: ResourcePool,
    /// Cancellation of the owning swarm, handed on to nested runs
    pub cancel: CancellationToken,
    /// Nesting depth of the run this step belongs to; top-level runs are 0
    pub depth: u32,
    /// Present when sub-routines may be started from this step
    pub subroutines: Option<Arc<dyn SubroutineRunner>>,
}

impl StrategyContext {
    pub fn inputs_value(&self) -> Value {
        Value::Object(self.inputs.clone())
    }

    /// Same step seen with a different type and configuration
    pub fn rerouted(&self, step_type: &str, config: Value) -> Self {
        let mut next = self.clone();
        next.step.step_type = step_type.to_string();
        next.step.config = config;
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub strategy_type: StrategyType,
    pub execution_time_ms: u64,
    pub resource_usage: ResourcePool,
    pub confidence: f64,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFeedback {
    pub outcome: Outcome,
    pub performance_score: f64,
    pub issues: Vec<String>,
    pub replan_requested: bool,
}

/// Outcome of one strategy execution. Built once, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyExecutionResult {
    pub success: bool,
    pub error: Option<String>,
    pub output: Value,
    pub metadata: ExecutionMetadata,
    pub feedback: ExecutionFeedback,
}

impl StrategyExecutionResult {
    pub fn success(strategy_type: StrategyType, output: Value, confidence: f64) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            success: true,
            error: None,
            output,
            metadata: ExecutionMetadata {
                strategy_type,
                execution_time_ms: 0,
                resource_usage: ResourcePool::default(),
                confidence,
                fallback_used: false,
            },
            feedback: ExecutionFeedback {
                outcome: Outcome::Success,
                performance_score: confidence,
                issues: Vec::new(),
                replan_requested: false,
            },
        }
    }

    pub fn failure(strategy_type: StrategyType, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            error: Some(error.clone()),
            output: Value::Null,
            metadata: ExecutionMetadata {
                strategy_type,
                execution_time_ms: 0,
                resource_usage: ResourcePool::default(),
                confidence: 0.0,
                fallback_used: false,
            },
            feedback: ExecutionFeedback {
                outcome: Outcome::Failure,
                performance_score: 0.0,
                issues: vec![error],
                replan_requested: false,
            },
        }
    }

    pub fn with_usage(mut self, usage: ResourcePool) -> Self {
        self.metadata.resource_usage = usage;
        self
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.metadata.execution_time_ms = ms;
        self.metadata.resource_usage.time_ms = self.metadata.resource_usage.time_ms.max(ms);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.feedback.issues.push(issue.into());
        if self.success {
            self.feedback.outcome = Outcome::Partial;
        }
        self
    }

    pub fn with_replan(mut self) -> Self {
        self.feedback.replan_requested = true;
        self
    }

    pub fn as_fallback(mut self) -> Self {
        self.metadata.fallback_used = true;
        self
    }
}

/// Aggregate counters for one strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_time_ms: u64,
    pub average_confidence: f64,
}

impl Performance {
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

/// Lock-free execution counters
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    executions: AtomicU64,
    successes: AtomicU64,
    total_time_ms: AtomicU64,
    // confidence summed in thousandths
    confidence_milli: AtomicU64,
}

impl PerformanceTracker {
    pub fn record(&self, result: &StrategyExecutionResult) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
        self.total_time_ms
            .fetch_add(result.metadata.execution_time_ms, Ordering::Relaxed);
        self.confidence_milli.fetch_add(
            (result.metadata.confidence * 1000.0).round() as u64,
            Ordering::Relaxed,
        );
    }

    pub fn snapshot(&self) -> Performance {
        let executions = self.executions.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let confidence = self.confidence_milli.load(Ordering::Relaxed);
        Performance {
            executions,
            successes,
            failures: executions.saturating_sub(successes),
            total_time_ms: self.total_time_ms.load(Ordering::Relaxed),
            average_confidence: if executions == 0 {
                0.0
            } else {
                confidence as f64 / 1000.0 / executions as f64
            },
        }
    }
}

/// One way of carrying out a step
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn strategy_type(&self) -> StrategyType;

    fn can_handle(&self, step_type: &str, config: &Value) -> bool;

    /// Errors returned here are turned into failure results by the registry
    async fn execute(&self, context: &StrategyContext) -> EngineResult<StrategyExecutionResult>;

    /// Minimum a step lease must cover before this strategy may run
    fn estimate_resources(&self, step: &StepInfo) -> ResourcePool;

    fn tracker(&self) -> &PerformanceTracker;

    fn performance_metrics(&self) -> Performance {
        self.tracker().snapshot()
    }
}
