use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::core::error::{EngineError, EngineResult};
use crate::navigation::Location;
use crate::resources::ResourcePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// A step lease could not be granted from what the run had left
    Exhausted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => matches!(next, RunStatus::Running | RunStatus::Cancelled),
            RunStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// One execution of one routine on behalf of a swarm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub swarm_id: String,
    pub routine_id: String,
    pub status: RunStatus,
    pub location: Option<Location>,
    /// Routine inputs plus the output of every completed step, keyed by node id
    pub variables: Map<String, Value>,
    pub steps_executed: u64,
    pub issues: Vec<String>,
    pub usage: ResourcePool,
    pub replan_requested: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        id: impl Into<String>,
        swarm_id: impl Into<String>,
        routine_id: impl Into<String>,
        variables: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            swarm_id: swarm_id.into(),
            routine_id: routine_id.into(),
            status: RunStatus::Pending,
            location: None,
            variables,
            steps_executed: 0,
            issues: Vec::new(),
            usage: ResourcePool::default(),
            replan_requested: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn context_value(&self) -> Value {
        Value::Object(self.variables.clone())
    }

    pub fn outcome(&self) -> RunOutcome {
        RunOutcome {
            run_id: self.id.clone(),
            routine_id: self.routine_id.clone(),
            status: self.status,
            steps_executed: self.steps_executed,
            issues: self.issues.clone(),
            replan_requested: self.replan_requested,
            variables: self.variables.clone(),
            usage: self.usage,
        }
    }
}

/// What Tier One learns when a run ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub routine_id: String,
    pub status: RunStatus,
    pub steps_executed: u64,
    pub issues: Vec<String>,
    pub replan_requested: bool,
    pub variables: Map<String, Value>,
    /// Summed usage of every step, charged to the run lease on release
    pub usage: ResourcePool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::new("run-1", "swarm-1", "r", Map::new());
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Exhausted).unwrap();
        assert!(run.finished_at.is_some());
        assert!(run.transition(RunStatus::Running).is_err());
    }

    #[test]
    fn test_pending_cannot_complete() {
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Cancelled));
    }
}
