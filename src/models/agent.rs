//! Agent and tool catalog models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Agent model. Agents are database-resident and shared across instances;
/// the row is authoritative, never a process-global map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    /// Names of registered tools this agent may call
    pub tools: Vec<String>,
    /// Delegate agents exposed to this agent as tools
    pub agent_ids: Vec<Uuid>,
    pub max_tokens: Option<i32>,
    pub temperature: Option<f64>,
    pub top_k: Option<i32>,
    pub top_p: Option<f64>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating or updating an agent by name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub agent_ids: Vec<Uuid>,
    pub max_tokens: Option<i32>,
    pub temperature: Option<f64>,
    pub top_k: Option<i32>,
    pub top_p: Option<f64>,
    #[serde(default = "default_metadata")]
    pub metadata: Value,
}

fn default_metadata() -> Value {
    serde_json::json!({})
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            system_prompt: String::new(),
            tools: Vec::new(),
            agent_ids: Vec::new(),
            max_tokens: None,
            temperature: None,
            top_k: None,
            top_p: None,
            metadata: default_metadata(),
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn delegates(mut self, agent_ids: Vec<Uuid>) -> Self {
        self.agent_ids = agent_ids;
        self
    }

    pub fn max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Tool catalog row. Regular tools are advertised here by registering
/// instances; delegate agents get a row with `is_agent_tool` set and an
/// `agent_id` back-pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRow {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub is_agent_tool: bool,
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tool name a delegate agent is exposed under
pub fn delegate_tool_name(agent_name: &str) -> String {
    format!("agent__{}", agent_name)
}

/// Input schema every delegate-agent tool shares
pub fn delegate_tool_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "task": {
                "type": "string",
                "description": "The task to hand to the delegate agent"
            }
        },
        "required": ["task"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegate_tool_name() {
        assert_eq!(delegate_tool_name("researcher"), "agent__researcher");
    }

    #[test]
    fn test_delegate_schema_shape() {
        let schema = delegate_tool_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"][0], "task");
        assert_eq!(schema["properties"]["task"]["type"], "string");
    }

    #[test]
    fn test_agent_spec_builder() {
        let spec = AgentSpec::new("helper", "claude-sonnet-4-20250514")
            .system_prompt("be helpful")
            .tools(vec!["echo".into()])
            .max_tokens(2048);
        assert_eq!(spec.name, "helper");
        assert_eq!(spec.tools, vec!["echo"]);
        assert_eq!(spec.max_tokens, Some(2048));
        assert!(spec.agent_ids.is_empty());
    }
}
