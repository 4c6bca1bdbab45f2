use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// `Active → Scheduled` is the redelivery of an expired claim
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Scheduled => matches!(next, TaskStatus::Active | TaskStatus::Cancelled),
            TaskStatus::Active => matches!(
                next,
                TaskStatus::Scheduled
                    | TaskStatus::Completed
                    | TaskStatus::Failed
                    | TaskStatus::Cancelled
            ),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Work a queued task stands for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Start a swarm and drive it to a terminal state
    Swarm {
        goal: String,
        #[serde(default)]
        channel_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub priority: u32,
    pub status: TaskStatus,
    pub requester_id: String,
    pub premium: bool,
    /// Deliveries so far
    pub attempts: u32,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Result of a completed task or reason of a failed one
    pub result: Option<Value>,
    pub error: Option<String>,
    /// FIFO tie-breaker among equal priorities
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit entry for one status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub requester_id: String,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_are_final() {
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(TaskStatus::Scheduled));
        }
        assert!(!TaskStatus::Scheduled.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Active.can_transition_to(TaskStatus::Scheduled));
    }

    #[test]
    fn test_payload_wire_format() {
        let payload: TaskPayload =
            serde_json::from_str(r#"{"type": "swarm", "goal": "triage inbox"}"#).unwrap();
        assert_eq!(
            payload,
            TaskPayload::Swarm {
                goal: "triage inbox".into(),
                channel_id: None
            }
        );
    }
}
