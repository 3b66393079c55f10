//! Session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Session model: an ordered message history plus nesting metadata.
/// Child runs (agent-as-tool) execute in child sessions, which is how a
/// delegate's conversation stays out of its parent's context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub parent_session_id: Option<Uuid>,
    pub depth: i32,
    pub metadata: Value,
    pub compaction_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
