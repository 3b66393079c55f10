//! Tool execution model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Tool execution state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ToolExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolExecutionState::Completed | ToolExecutionState::Failed | ToolExecutionState::Skipped
        )
    }
}

impl fmt::Display for ToolExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolExecutionState::Pending => write!(f, "pending"),
            ToolExecutionState::Running => write!(f, "running"),
            ToolExecutionState::Completed => write!(f, "completed"),
            ToolExecutionState::Failed => write!(f, "failed"),
            ToolExecutionState::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ToolExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ToolExecutionState::Pending),
            "running" => Ok(ToolExecutionState::Running),
            "completed" => Ok(ToolExecutionState::Completed),
            "failed" => Ok(ToolExecutionState::Failed),
            "skipped" => Ok(ToolExecutionState::Skipped),
            _ => Err(format!("Invalid tool execution state: {}", s)),
        }
    }
}

/// Tool execution model: one row per tool_use block emitted by the model
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub iteration_id: Uuid,

    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,

    pub is_agent_tool: bool,
    pub agent_id: Option<Uuid>,
    pub child_run_id: Option<Uuid>,

    pub output: Option<String>,
    pub is_error: bool,
    pub state: ToolExecutionState,

    pub claimed_by_instance_id: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub snooze_count: i32,
    pub last_error: Option<String>,

    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for s in ["pending", "running", "completed", "failed", "skipped"] {
            let parsed: ToolExecutionState = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn test_terminal() {
        assert!(ToolExecutionState::Completed.is_terminal());
        assert!(ToolExecutionState::Failed.is_terminal());
        assert!(ToolExecutionState::Skipped.is_terminal());
        assert!(!ToolExecutionState::Pending.is_terminal());
        assert!(!ToolExecutionState::Running.is_terminal());
    }
}
