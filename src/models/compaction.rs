//! Compaction audit models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which strategy a compaction pass used
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    /// Prune tool outputs first, summarize only if still over budget
    Hybrid,
    /// Go straight to summarization
    Summarize,
}

impl fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionStrategy::Hybrid => write!(f, "hybrid"),
            CompactionStrategy::Summarize => write!(f, "summarize"),
        }
    }
}

impl std::str::FromStr for CompactionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hybrid" => Ok(CompactionStrategy::Hybrid),
            "summarize" => Ok(CompactionStrategy::Summarize),
            _ => Err(format!("Invalid compaction strategy: {}", s)),
        }
    }
}

/// Audit record for one compaction operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionEvent {
    pub id: Uuid,
    pub session_id: Uuid,
    pub strategy: CompactionStrategy,
    pub tokens_before: i64,
    pub tokens_after: i64,
    pub messages_removed: i32,
    pub removed_message_ids: Vec<Uuid>,
    pub summary: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}
