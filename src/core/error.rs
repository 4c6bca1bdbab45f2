use thiserror::Error;

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Error taxonomy for the three-tier execution engine
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// No navigator or strategy matches, or the engine is misconfigured.
    /// Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A lease request exceeds what the parent pool has left
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The parent lease may not issue children (frozen, settled or expired)
    #[error("Allocation not eligible: {0}")]
    NotEligible(String),

    /// A strategy failed while executing a step
    #[error("Strategy execution failed: {0}")]
    StrategyExecution(String),

    /// Timeout or malformed response from the reasoning service
    #[error("Reasoning service error: {0}")]
    ReasoningService(String),

    /// Double credit or over-credit detected. Always fatal.
    #[error("Allocation consistency violation: {0}")]
    AllocationConsistency(String),

    /// More than one next location and nothing in context picks one
    #[error("Ambiguous branch at node '{node_id}': candidates {candidates:?}")]
    AmbiguousBranch {
        node_id: String,
        candidates: Vec<String>,
    },

    /// Illegal lifecycle transition
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Unknown swarm, run, task, allocation or routine
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Work stopped by cancellation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// I/O errors (stringified so the error stays `Clone`)
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Only configuration and allocation-consistency errors are fatal at every level
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            EngineError::Configuration(_) | EngineError::AllocationConsistency(_)
        )
    }

    /// Short machine-readable tag, used in feedback issues and history records
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "configuration",
            EngineError::ResourceExhausted(_) => "resource_exhausted",
            EngineError::NotEligible(_) => "not_eligible",
            EngineError::StrategyExecution(_) => "strategy_execution",
            EngineError::ReasoningService(_) => "reasoning_service",
            EngineError::AllocationConsistency(_) => "allocation_consistency",
            EngineError::AmbiguousBranch { .. } => "ambiguous_branch",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::Timeout(_) => "timeout",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_and_consistency_are_fatal() {
        assert!(!EngineError::Configuration("x".into()).is_recoverable());
        assert!(!EngineError::AllocationConsistency("x".into()).is_recoverable());
        assert!(EngineError::ResourceExhausted("x".into()).is_recoverable());
        assert!(EngineError::ReasoningService("x".into()).is_recoverable());
        assert!(EngineError::StrategyExecution("x".into()).is_recoverable());
    }

    #[test]
    fn test_ambiguous_branch_message_lists_candidates() {
        let err = EngineError::AmbiguousBranch {
            node_id: "gateway".into(),
            candidates: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("gateway"));
        assert!(msg.contains("\"a\""));
        assert_eq!(err.kind(), "ambiguous_branch");
    }
}
