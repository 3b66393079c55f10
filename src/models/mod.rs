//! Data models for the engine's persistent state
//!
//! One file per table family. Enums are stored as `text` columns and
//! round-tripped through `Display`/`FromStr`.

pub mod agent;
pub mod compaction;
pub mod instance;
pub mod iteration;
pub mod message;
pub mod run;
pub mod session;
pub mod tool_execution;

pub use agent::{delegate_tool_name, delegate_tool_schema, Agent, AgentSpec, ToolRow};
pub use compaction::{CompactionEvent, CompactionStrategy};
pub use instance::Instance;
pub use iteration::{BatchStatus, Iteration, TriggerType};
pub use message::{ContentBlock, Message, Role};
pub use run::{state_for_stop_reason, Run, RunErrorKind, RunMode, RunState};
pub use session::Session;
pub use tool_execution::{ToolExecution, ToolExecutionState};

use serde::{Deserialize, Serialize};

/// Token counters reported by the provider, accumulated per iteration,
/// message, and run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

impl TokenUsage {
    /// Sum another usage record into this one
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }

    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_add() {
        let mut a = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_tokens: 1,
            cache_read_tokens: 2,
        };
        let b = TokenUsage {
            input_tokens: 3,
            output_tokens: 4,
            ..Default::default()
        };
        a.add(&b);
        assert_eq!(a.input_tokens, 13);
        assert_eq!(a.output_tokens, 9);
        assert_eq!(a.total(), 25);
    }
}
