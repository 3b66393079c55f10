//! Tool capability surface
//!
//! A tool is a named, described, JSON-Schema-typed callback. Tool authors get
//! a flat signature -- context and input in, output string or error out -- and
//! signal retry behavior through the error variants. All the concurrency
//! lives in the workers, never in user code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Reserved prefix for delegate-agent tools
pub const AGENT_TOOL_PREFIX: &str = "agent__";

/// Tool outcome signaling.
///
/// `Cancel` and `Discard` are permanent: the execution fails without further
/// attempts. `Snooze` reschedules without spending an attempt. Anything else
/// is retriable until the attempt budget runs out.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("cancelled: {0}")]
    Cancel(String),

    #[error("discarded: {0}")]
    Discard(String),

    #[error("snoozed for {0:?}")]
    Snooze(Duration),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        ToolError::Failed(message.into())
    }

    /// True for outcomes that must not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(self, ToolError::Cancel(_) | ToolError::Discard(_))
    }
}

/// Context handed to every tool callback
#[derive(Clone)]
pub struct ToolContext {
    pub run_id: Uuid,
    pub session_id: Uuid,
    /// Variables provided at run creation, inherited by child runs
    pub variables: Value,
    /// Shared database pool for tool-side persistence. Tool side effects are
    /// at-least-once; idempotency is the tool author's contract.
    pub db: PgPool,
}

impl ToolContext {
    /// Look up a run variable by key
    pub fn var(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }
}

/// A callable tool
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model calls this tool by
    fn name(&self) -> &str;

    /// Description shown to the model
    fn description(&self) -> &str;

    /// JSON Schema (`type: "object"`) for the input
    fn input_schema(&self) -> Value;

    async fn execute(
        &self,
        ctx: &ToolContext,
        input: Value,
    ) -> std::result::Result<String, ToolError>;
}

type ToolCallback = dyn Fn(
        ToolContext,
        Value,
    ) -> futures::future::BoxFuture<'static, std::result::Result<String, ToolError>>
    + Send
    + Sync;

/// Closure-backed tool, for integrators who don't want a struct per tool
pub struct FnTool {
    name: String,
    description: String,
    schema: Value,
    callback: Box<ToolCallback>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        callback: F,
    ) -> Self
    where
        F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<String, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            callback: Box::new(move |ctx, input| Box::pin(callback(ctx, input))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        input: Value,
    ) -> std::result::Result<String, ToolError> {
        (self.callback)(ctx.clone(), input).await
    }
}

/// Per-instance tool registry. Registration defines this instance's
/// capability set; the claim protocol only hands it work it can execute.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names must be unique and must not use the delegate
    /// prefix.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if name.is_empty() {
            return Err(Error::Validation("tool name must not be empty".to_string()));
        }
        if name.starts_with(AGENT_TOOL_PREFIX) {
            return Err(Error::Validation(format!(
                "tool name '{}' uses the reserved '{}' prefix",
                name, AGENT_TOOL_PREFIX
            )));
        }
        if self.tools.contains_key(&name) {
            return Err(Error::Validation(format!(
                "tool '{}' is already registered",
                name
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All registered tool names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Provider-shaped definitions for a subset of registered tools
    pub fn definitions_for(&self, names: &[String]) -> Vec<Value> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "input_schema": tool.input_schema(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool() -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            "echo",
            "Echo the input back",
            json!({
                "type": "object",
                "properties": {"input": {"type": "string"}},
                "required": ["input"]
            }),
            |_ctx, input| async move {
                input
                    .get("input")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| ToolError::failed("missing 'input'"))
            },
        ))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();
        assert!(registry.contains("echo"));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();
        assert!(registry.register(echo_tool()).is_err());
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let mut registry = ToolRegistry::new();
        let tool = Arc::new(FnTool::new(
            "agent__sneaky",
            "",
            json!({"type": "object"}),
            |_ctx, _input| async move { Ok(String::new()) },
        ));
        assert!(registry.register(tool).is_err());
    }

    #[test]
    fn test_definitions_shape() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();
        let defs = registry.definitions_for(&["echo".to_string(), "missing".to_string()]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0]["name"], "echo");
        assert_eq!(defs[0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_error_dispositions() {
        assert!(ToolError::Cancel("no".into()).is_permanent());
        assert!(ToolError::Discard("no".into()).is_permanent());
        assert!(!ToolError::Snooze(Duration::from_secs(1)).is_permanent());
        assert!(!ToolError::failed("flaky").is_permanent());
    }
}
