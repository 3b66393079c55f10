//! Iteration model: one LLM call within a run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What caused an iteration to be started
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    UserPrompt,
    ToolResults,
    Continuation,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::UserPrompt => write!(f, "user_prompt"),
            TriggerType::ToolResults => write!(f, "tool_results"),
            TriggerType::Continuation => write!(f, "continuation"),
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_prompt" => Ok(TriggerType::UserPrompt),
            "tool_results" => Ok(TriggerType::ToolResults),
            "continuation" => Ok(TriggerType::Continuation),
            _ => Err(format!("Invalid trigger type: {}", s)),
        }
    }
}

/// Provider-side processing status of a deferred batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Canceling,
    Ended,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::InProgress => write!(f, "in_progress"),
            BatchStatus::Canceling => write!(f, "canceling"),
            BatchStatus::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(BatchStatus::InProgress),
            "canceling" => Ok(BatchStatus::Canceling),
            "ended" => Ok(BatchStatus::Ended),
            _ => Err(format!("Invalid batch status: {}", s)),
        }
    }
}

/// Iteration model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: Uuid,
    pub run_id: Uuid,
    pub iteration_number: i32,
    pub trigger_type: TriggerType,
    pub is_streaming: bool,

    // Batch plumbing
    pub batch_id: Option<String>,
    pub batch_request_id: Option<String>,
    pub batch_status: Option<BatchStatus>,
    pub batch_poll_count: i32,
    pub batch_last_poll_at: Option<DateTime<Utc>>,
    pub batch_expires_at: Option<DateTime<Utc>>,

    // Streaming plumbing
    pub streaming_started_at: Option<DateTime<Utc>>,
    pub streaming_completed_at: Option<DateTime<Utc>>,

    // Response
    pub stop_reason: Option<String>,
    pub response_message_id: Option<String>,
    pub has_tool_use: bool,
    pub tool_execution_count: i32,

    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,

    pub error_type: Option<String>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_type_round_trip() {
        for s in ["user_prompt", "tool_results", "continuation"] {
            let parsed: TriggerType = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn test_batch_status_round_trip() {
        for s in ["in_progress", "canceling", "ended"] {
            let parsed: BatchStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("bogus".parse::<BatchStatus>().is_err());
    }
}
