//! emissary - Durable multi-turn LLM agent runs on PostgreSQL
//!
//! A distributed execution engine for agent conversations: runs survive
//! process restarts, may be created inside a caller's transaction, may nest
//! (agent-as-tool), and are claimed by any of N cooperating worker processes
//! over the same database. Coordination is trigger-emitted LISTEN/NOTIFY
//! plus polling; claiming is `FOR UPDATE SKIP LOCKED`.

pub mod compaction;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod history;
pub mod models;
pub mod notify;
pub mod provider;
pub mod store;
pub mod tools;
pub mod workers;

// Re-export main types
pub use config::{CompactionConfig, Config};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use database::Database;
pub use error::{Error, Result};

// Re-export the data model callers interact with
pub use models::{
    Agent, AgentSpec, CompactionStrategy, ContentBlock, Message, Role, Run, RunErrorKind,
    RunMode, RunState, Session, TokenUsage,
};

// Re-export the tool capability surface
pub use tools::{FnTool, Tool, ToolContext, ToolError, ToolRegistry};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }
}
