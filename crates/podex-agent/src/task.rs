// Task entity
//
// One task is one user-message-to-response cycle. Status only moves
// forward: pending -> running -> completed | failed. Cancellation maps to
// failed with a cancellation error.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use podex_core::ToolCall;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a transition to `next` moves forward
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Failed) => true,
            _ => false,
        }
    }
}

/// A unit of agent work tracked by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub message: String,
    pub context: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
    pub tokens_used: u32,
}

impl Task {
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        message: impl Into<String>,
        context: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            message: message.into(),
            context,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            result: None,
            tool_calls: Vec::new(),
            error: None,
            tokens_used: 0,
        }
    }

    /// Move the task forward. Backward or repeated transitions are ignored
    /// and reported as false.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Mark the task failed with an error message
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        let moved = self.transition(TaskStatus::Failed);
        if moved {
            self.error = Some(error.into());
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("sess-1", "agent-1", "do the thing", HashMap::new())
    }

    #[test]
    fn test_forward_transitions() {
        let mut t = task();
        assert!(t.transition(TaskStatus::Running));
        assert!(t.transition(TaskStatus::Completed));
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut t = task();
        t.transition(TaskStatus::Running);
        t.transition(TaskStatus::Completed);
        assert!(!t.transition(TaskStatus::Running));
        assert!(!t.transition(TaskStatus::Failed));
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let mut t = task();
        assert!(t.fail("cancelled before start"));
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("cancelled before start"));
    }

    #[test]
    fn test_fail_after_terminal_keeps_first_error() {
        let mut t = task();
        t.transition(TaskStatus::Running);
        assert!(t.fail("first"));
        assert!(!t.fail("second"));
        assert_eq!(t.error.as_deref(), Some("first"));
    }
}
