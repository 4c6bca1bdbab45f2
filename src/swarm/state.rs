use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::config::SwarmDefaults;
use crate::core::error::{EngineError, EngineResult};
use crate::resources::ResourcePool;

/// Tier-one lifecycle of a swarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmState {
    Initializing,
    Analyzing,
    Strategizing,
    Executing,
    Reviewing,
    Completed,
    Failed,
    Cancelled,
}

impl SwarmState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwarmState::Completed | SwarmState::Failed | SwarmState::Cancelled
        )
    }

    /// Legal edges of the lifecycle graph.
    ///
    /// Every non-terminal state may enter `Reviewing` and `Failed`. The
    /// coordinator always passes through `Reviewing`, fatal errors included,
    /// so the direct edge to `Failed` is only taken by callers that drive
    /// the lifecycle by hand. Only `Reviewing` leads to `Completed` and
    /// `Cancelled`. Terminal states have no way out.
    pub fn can_transition_to(self, next: SwarmState) -> bool {
        use SwarmState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Reviewing, Completed) | (Reviewing, Cancelled) => true,
            (Reviewing, _) => false,
            (_, Reviewing) => true,
            (Initializing, Analyzing)
            | (Analyzing, Strategizing)
            | (Strategizing, Executing)
            | (Executing, Strategizing) => true,
            _ => false,
        }
    }

    /// Checked transition
    pub fn transition(self, next: SwarmState) -> EngineResult<SwarmState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EngineError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for SwarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwarmState::Initializing => "initializing",
            SwarmState::Analyzing => "analyzing",
            SwarmState::Strategizing => "strategizing",
            SwarmState::Executing => "executing",
            SwarmState::Reviewing => "reviewing",
            SwarmState::Completed => "completed",
            SwarmState::Failed => "failed",
            SwarmState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// Per-swarm settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub max_agents: usize,
    pub min_agents: usize,
    pub consensus_threshold: f64,
    pub decision_timeout_ms: u64,
    pub adaptation_interval_ms: u64,
    pub max_concurrent_runs: usize,
    pub max_replans: u32,
    pub pool: ResourcePool,
    pub pool_duration_ms: u64,
}

impl From<&SwarmDefaults> for SwarmConfig {
    fn from(defaults: &SwarmDefaults) -> Self {
        Self {
            max_agents: defaults.max_agents,
            min_agents: defaults.min_agents,
            consensus_threshold: defaults.consensus_threshold,
            decision_timeout_ms: defaults.decision_timeout_ms,
            adaptation_interval_ms: defaults.adaptation_interval_ms,
            max_concurrent_runs: defaults.max_concurrent_runs.max(1),
            max_replans: defaults.max_replans,
            pool: defaults.pool,
            pool_duration_ms: defaults.pool_duration_ms,
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self::from(&SwarmDefaults::default())
    }
}

/// A swarm as known to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swarm {
    pub id: String,
    pub goal: String,
    pub state: SwarmState,
    pub config: SwarmConfig,
    /// Requester that scheduled the swarm
    pub requester_id: String,
    /// Notification channel for swarm events
    pub channel_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Swarm {
    pub fn new(goal: impl Into<String>, requester_id: impl Into<String>, config: SwarmConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.into(),
            state: SwarmState::Initializing,
            config,
            requester_id: requester_id.into(),
            channel_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }
}
