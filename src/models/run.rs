//! Run model and state machine types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// How a run talks to the provider: deferred batch or inline streaming
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Batch,
    Streaming,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Batch => write!(f, "batch"),
            RunMode::Streaming => write!(f, "streaming"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch" => Ok(RunMode::Batch),
            "streaming" => Ok(RunMode::Streaming),
            _ => Err(format!("Invalid run mode: {}", s)),
        }
    }
}

/// Run state machine.
///
/// Batch runs move `pending -> batch_submitting -> batch_pending ->
/// batch_processing -> {pending_tools | completed | awaiting_input | failed}`,
/// looping through `pending_tools -> pending_api -> batch_submitting` while
/// the model keeps requesting tools. Streaming runs collapse the three batch
/// states into `streaming`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    BatchSubmitting,
    BatchPending,
    BatchProcessing,
    Streaming,
    PendingTools,
    PendingApi,
    AwaitingInput,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    /// Terminal states are never left and their rows are never mutated again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }

    /// The first in-progress state after a successful claim
    pub fn claimed_state(mode: RunMode) -> RunState {
        match mode {
            RunMode::Batch => RunState::BatchSubmitting,
            RunMode::Streaming => RunState::Streaming,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::BatchSubmitting => "batch_submitting",
            RunState::BatchPending => "batch_pending",
            RunState::BatchProcessing => "batch_processing",
            RunState::Streaming => "streaming",
            RunState::PendingTools => "pending_tools",
            RunState::PendingApi => "pending_api",
            RunState::AwaitingInput => "awaiting_input",
            RunState::Completed => "completed",
            RunState::Cancelled => "cancelled",
            RunState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "batch_submitting" => Ok(RunState::BatchSubmitting),
            "batch_pending" => Ok(RunState::BatchPending),
            "batch_processing" => Ok(RunState::BatchProcessing),
            "streaming" => Ok(RunState::Streaming),
            "pending_tools" => Ok(RunState::PendingTools),
            "pending_api" => Ok(RunState::PendingApi),
            "awaiting_input" => Ok(RunState::AwaitingInput),
            "completed" => Ok(RunState::Completed),
            "cancelled" => Ok(RunState::Cancelled),
            "failed" => Ok(RunState::Failed),
            _ => Err(format!("Invalid run state: {}", s)),
        }
    }
}

/// Failure kinds stored in `error_type` and surfaced to waiters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    BatchSubmitError,
    BatchError,
    BatchCanceled,
    BatchExpired,
    StreamingError,
    ToolError,
    InstanceDisconnected,
    RescueFailed,
    AgentNotFound,
    ToolNotFound,
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunErrorKind::BatchSubmitError => "batch_submit_error",
            RunErrorKind::BatchError => "batch_error",
            RunErrorKind::BatchCanceled => "batch_canceled",
            RunErrorKind::BatchExpired => "batch_expired",
            RunErrorKind::StreamingError => "streaming_error",
            RunErrorKind::ToolError => "tool_error",
            RunErrorKind::InstanceDisconnected => "instance_disconnected",
            RunErrorKind::RescueFailed => "rescue_failed",
            RunErrorKind::AgentNotFound => "agent_not_found",
            RunErrorKind::ToolNotFound => "tool_not_found",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RunErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch_submit_error" => Ok(RunErrorKind::BatchSubmitError),
            "batch_error" => Ok(RunErrorKind::BatchError),
            "batch_canceled" => Ok(RunErrorKind::BatchCanceled),
            "batch_expired" => Ok(RunErrorKind::BatchExpired),
            "streaming_error" => Ok(RunErrorKind::StreamingError),
            "tool_error" => Ok(RunErrorKind::ToolError),
            "instance_disconnected" => Ok(RunErrorKind::InstanceDisconnected),
            "rescue_failed" => Ok(RunErrorKind::RescueFailed),
            "agent_not_found" => Ok(RunErrorKind::AgentNotFound),
            "tool_not_found" => Ok(RunErrorKind::ToolNotFound),
            _ => Err(format!("Invalid run error kind: {}", s)),
        }
    }
}

/// Run model: one end-to-end agent invocation, possibly many iterations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub parent_tool_execution_id: Option<Uuid>,
    pub depth: i32,

    pub state: RunState,
    pub previous_state: Option<RunState>,
    pub run_mode: RunMode,

    pub prompt: String,
    pub variables: Value,
    pub response_text: Option<String>,

    pub current_iteration: i32,
    pub current_iteration_id: Option<Uuid>,
    pub iteration_count: i32,
    pub tool_iterations: i32,

    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,

    pub error_type: Option<RunErrorKind>,
    pub error_message: Option<String>,

    pub claimed_by_instance_id: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub rescue_attempts: i32,
    pub last_rescue_at: Option<DateTime<Utc>>,

    pub finalized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Map a provider stop reason onto the next run state.
///
/// Unrecognized stop reasons complete the run; the verbatim string is kept on
/// the iteration row so drift stays observable.
pub fn state_for_stop_reason(stop_reason: Option<&str>) -> RunState {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => RunState::Completed,
        Some("tool_use") => RunState::PendingTools,
        Some("max_tokens") | Some("pause_turn") => RunState::AwaitingInput,
        Some("refusal") | None => RunState::Failed,
        Some(_) => RunState::Completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for s in [
            "pending",
            "batch_submitting",
            "batch_pending",
            "batch_processing",
            "streaming",
            "pending_tools",
            "pending_api",
            "awaiting_input",
            "completed",
            "cancelled",
            "failed",
        ] {
            let parsed: RunState = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::PendingTools.is_terminal());
        assert!(!RunState::Streaming.is_terminal());
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(state_for_stop_reason(Some("end_turn")), RunState::Completed);
        assert_eq!(
            state_for_stop_reason(Some("stop_sequence")),
            RunState::Completed
        );
        assert_eq!(
            state_for_stop_reason(Some("tool_use")),
            RunState::PendingTools
        );
        assert_eq!(
            state_for_stop_reason(Some("max_tokens")),
            RunState::AwaitingInput
        );
        assert_eq!(
            state_for_stop_reason(Some("pause_turn")),
            RunState::AwaitingInput
        );
        assert_eq!(state_for_stop_reason(Some("refusal")), RunState::Failed);
        assert_eq!(state_for_stop_reason(None), RunState::Failed);
        // Fail-open for provider drift
        assert_eq!(
            state_for_stop_reason(Some("some_future_reason")),
            RunState::Completed
        );
    }

    #[test]
    fn test_claimed_state() {
        assert_eq!(
            RunState::claimed_state(RunMode::Batch),
            RunState::BatchSubmitting
        );
        assert_eq!(
            RunState::claimed_state(RunMode::Streaming),
            RunState::Streaming
        );
    }
}
