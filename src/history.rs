//! Conversation assembly for provider calls
//!
//! Turns a run's stored context into the exact message list the provider
//! accepts. The provider enforces strict adjacency: every assistant
//! `tool_use` block must be answered by a `tool_result` block in a following
//! user message before the next assistant message. Failed or rescued sibling
//! runs can leave unmatched halves behind, so assembly always runs a repair
//! pass that drops them.

use serde_json::Value;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::models::message::content_to_value;
use crate::models::{
    delegate_tool_name, delegate_tool_schema, Agent, ContentBlock, Message, Role, ToolExecution,
    ToolExecutionState,
};
use crate::provider::ProviderRequest;
use crate::tools::ToolRegistry;

/// A message reduced to what the provider sees
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTurn {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

/// Enforce tool_use/tool_result adjacency over a message list.
///
/// A `tool_use` block survives only if some user message before the next
/// assistant message answers it; a `tool_result` block survives only if the
/// closest preceding assistant message asked for it. Messages left empty are
/// dropped, as are system-role rows (the system prompt travels separately).
pub fn repair_adjacency(messages: &[Message]) -> Vec<ProviderTurn> {
    let turns: Vec<&Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();

    // For each assistant turn, which tool_use ids get answered before the
    // next assistant turn.
    let mut answered: Vec<HashSet<String>> = vec![HashSet::new(); turns.len()];
    for (i, message) in turns.iter().enumerate() {
        if message.role != Role::Assistant {
            continue;
        }
        let mut ids = HashSet::new();
        for later in &turns[i + 1..] {
            if later.role == Role::Assistant {
                break;
            }
            for block in &later.content {
                if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                    ids.insert(tool_use_id.clone());
                }
            }
        }
        answered[i] = ids;
    }

    let mut repaired = Vec::with_capacity(turns.len());
    let mut active_uses: HashSet<String> = HashSet::new();

    for (i, message) in turns.iter().enumerate() {
        let content: Vec<ContentBlock> = match message.role {
            Role::Assistant => {
                let kept: Vec<ContentBlock> = message
                    .content
                    .iter()
                    .filter(|block| match block {
                        ContentBlock::ToolUse { id, .. } => answered[i].contains(id),
                        _ => true,
                    })
                    .cloned()
                    .collect();
                active_uses = kept
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                        _ => None,
                    })
                    .collect();
                kept
            }
            _ => message
                .content
                .iter()
                .filter(|block| match block {
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        active_uses.contains(tool_use_id)
                    }
                    _ => true,
                })
                .cloned()
                .collect(),
        };

        if !content.is_empty() {
            repaired.push(ProviderTurn {
                role: message.role,
                content,
            });
        }
    }

    repaired
}

/// Serialize repaired turns into provider-shaped `{role, content}` objects
pub fn to_provider_messages(turns: &[ProviderTurn]) -> Vec<Value> {
    turns
        .iter()
        .map(|turn| {
            serde_json::json!({
                "role": turn.role.to_string(),
                "content": content_to_value(&turn.content),
            })
        })
        .collect()
}

/// Provider tool definitions for a run: the agent's registered tools plus
/// one delegate tool per delegate agent.
///
/// Claim-time capability filtering should make a locally-missing tool
/// impossible; if it happens anyway (a tool unregistered mid-flight) the run
/// fails with `tool_not_found` before any provider call.
pub fn tool_definitions(
    registry: &ToolRegistry,
    agent: &Agent,
    delegates: &[Agent],
) -> Result<Vec<Value>> {
    for name in &agent.tools {
        if !registry.contains(name) {
            return Err(Error::Validation(format!(
                "agent '{}' needs tool '{}' which is not registered on this instance",
                agent.name, name
            )));
        }
    }

    let mut definitions = registry.definitions_for(&agent.tools);

    for delegate in delegates {
        let description = if delegate.system_prompt.is_empty() {
            format!("Delegate a task to the '{}' agent.", delegate.name)
        } else {
            format!(
                "Delegate a task to the '{}' agent. {}",
                delegate.name, delegate.system_prompt
            )
        };
        definitions.push(serde_json::json!({
            "name": delegate_tool_name(&delegate.name),
            "description": description,
            "input_schema": delegate_tool_schema(),
        }));
    }

    Ok(definitions)
}

/// Build the full provider request for one iteration
pub fn build_request(agent: &Agent, messages: Vec<Value>, tools: Vec<Value>) -> ProviderRequest {
    let mut request = ProviderRequest::new(agent.model.clone());
    if !agent.system_prompt.is_empty() {
        request.system = Some(agent.system_prompt.clone());
    }
    request.messages = messages;
    request.tools = tools;
    if let Some(max_tokens) = agent.max_tokens {
        request.max_tokens = max_tokens.max(1) as u32;
    }
    request.temperature = agent.temperature;
    request.top_k = agent.top_k;
    request.top_p = agent.top_p;
    request
}

/// Synthesize the user message that feeds a round of tool results back into
/// the next iteration: one `tool_result` block per execution, keyed by the
/// provider's `tool_use_id`.
pub fn tool_results_content(executions: &[ToolExecution]) -> Vec<ContentBlock> {
    executions
        .iter()
        .map(|exec| {
            let (content, is_error) = match exec.state {
                ToolExecutionState::Completed => {
                    (exec.output.clone().unwrap_or_default(), exec.is_error)
                }
                ToolExecutionState::Failed => (
                    exec.output
                        .clone()
                        .or_else(|| exec.last_error.clone())
                        .unwrap_or_else(|| "tool execution failed".to_string()),
                    true,
                ),
                ToolExecutionState::Skipped => ("tool execution skipped".to_string(), true),
                // Settled rounds never contain these; answer defensively
                // rather than send an unmatched tool_use upstream.
                ToolExecutionState::Pending | ToolExecutionState::Running => {
                    ("tool execution did not finish".to_string(), true)
                }
            };
            ContentBlock::tool_result(exec.tool_use_id.clone(), content, is_error)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn message(role: Role, content: Vec<ContentBlock>) -> Message {
        Message {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            run_id: None,
            role,
            content,
            is_preserved: false,
            is_summary: false,
            input_tokens: None,
            output_tokens: None,
            created_at: Utc::now(),
        }
    }

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: "echo".to_string(),
            input: json!({}),
        }
    }

    #[test]
    fn test_complete_pairs_survive() {
        let messages = vec![
            message(Role::User, vec![ContentBlock::text("say hi")]),
            message(
                Role::Assistant,
                vec![ContentBlock::text("on it"), tool_use("tu_1")],
            ),
            message(
                Role::User,
                vec![ContentBlock::tool_result("tu_1", "hi", false)],
            ),
            message(Role::Assistant, vec![ContentBlock::text("done: hi")]),
        ];

        let repaired = repair_adjacency(&messages);
        assert_eq!(repaired.len(), 4);
        assert_eq!(repaired[1].content.len(), 2);
        assert_eq!(repaired[2].content.len(), 1);
    }

    #[test]
    fn test_unmatched_tool_use_dropped() {
        // A failed sibling run left an assistant message whose tools never ran.
        let messages = vec![
            message(Role::User, vec![ContentBlock::text("go")]),
            message(
                Role::Assistant,
                vec![ContentBlock::text("trying"), tool_use("tu_dangling")],
            ),
            message(Role::User, vec![ContentBlock::text("next question")]),
        ];

        let repaired = repair_adjacency(&messages);
        assert_eq!(repaired.len(), 3);
        // The dangling tool_use is gone; its text sibling survives.
        assert_eq!(repaired[1].content, vec![ContentBlock::text("trying")]);
    }

    #[test]
    fn test_orphan_tool_result_dropped() {
        let messages = vec![
            message(
                Role::User,
                vec![
                    ContentBlock::tool_result("tu_ghost", "leftover", false),
                    ContentBlock::text("hello"),
                ],
            ),
            message(Role::Assistant, vec![ContentBlock::text("hi")]),
        ];

        let repaired = repair_adjacency(&messages);
        assert_eq!(repaired[0].content, vec![ContentBlock::text("hello")]);
    }

    #[test]
    fn test_assistant_message_emptied_by_repair_is_dropped() {
        let messages = vec![
            message(Role::User, vec![ContentBlock::text("go")]),
            message(Role::Assistant, vec![tool_use("tu_lost")]),
            message(Role::User, vec![ContentBlock::text("still there?")]),
        ];

        let repaired = repair_adjacency(&messages);
        assert_eq!(repaired.len(), 2);
        assert!(repaired.iter().all(|t| t.role != Role::Assistant));
    }

    #[test]
    fn test_adjacency_property_holds_after_repair() {
        // Property 4: every surviving tool_use is answered before the next
        // assistant turn.
        let messages = vec![
            message(Role::User, vec![ContentBlock::text("q")]),
            message(Role::Assistant, vec![tool_use("a"), tool_use("b")]),
            message(
                Role::User,
                vec![
                    ContentBlock::tool_result("a", "ra", false),
                    ContentBlock::tool_result("b", "rb", true),
                ],
            ),
            message(Role::Assistant, vec![tool_use("c")]),
            message(Role::User, vec![ContentBlock::text("unanswered")]),
        ];

        let repaired = repair_adjacency(&messages);
        for (i, turn) in repaired.iter().enumerate() {
            if turn.role != Role::Assistant {
                continue;
            }
            let uses: Vec<&str> = turn
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect();
            let mut answered = HashSet::new();
            for later in &repaired[i + 1..] {
                if later.role == Role::Assistant {
                    break;
                }
                for block in &later.content {
                    if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                        answered.insert(tool_use_id.as_str());
                    }
                }
            }
            for id in uses {
                assert!(answered.contains(id), "tool_use {} unanswered", id);
            }
        }
    }

    #[test]
    fn test_system_messages_excluded() {
        let messages = vec![
            message(Role::System, vec![ContentBlock::text("system note")]),
            message(Role::User, vec![ContentBlock::text("hello")]),
        ];
        let repaired = repair_adjacency(&messages);
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].role, Role::User);
    }

    #[test]
    fn test_provider_message_shape() {
        let turns = vec![ProviderTurn {
            role: Role::User,
            content: vec![ContentBlock::text("hi")],
        }];
        let values = to_provider_messages(&turns);
        assert_eq!(values[0]["role"], "user");
        assert_eq!(values[0]["content"][0]["type"], "text");
    }

    #[test]
    fn test_tool_results_content_states() {
        let base = ToolExecution {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            iteration_id: Uuid::new_v4(),
            tool_use_id: "tu_1".to_string(),
            tool_name: "echo".to_string(),
            input: json!({}),
            is_agent_tool: false,
            agent_id: None,
            child_run_id: None,
            output: Some("ok".to_string()),
            is_error: false,
            state: ToolExecutionState::Completed,
            claimed_by_instance_id: None,
            claimed_at: None,
            attempt_count: 1,
            max_attempts: 3,
            scheduled_at: Utc::now(),
            snooze_count: 0,
            last_error: None,
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let failed = ToolExecution {
            tool_use_id: "tu_2".to_string(),
            output: None,
            last_error: Some("boom".to_string()),
            state: ToolExecutionState::Failed,
            ..base.clone()
        };
        let skipped = ToolExecution {
            tool_use_id: "tu_3".to_string(),
            state: ToolExecutionState::Skipped,
            ..base.clone()
        };

        let content = tool_results_content(&[base, failed, skipped]);
        assert_eq!(
            content[0],
            ContentBlock::tool_result("tu_1", "ok", false)
        );
        assert_eq!(content[1], ContentBlock::tool_result("tu_2", "boom", true));
        match &content[2] {
            ContentBlock::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("unexpected block: {:?}", other),
        }
    }
}
