//! Conversation assembly tests: adjacency, delegate tools, request shape

use emissary::history::{
    build_request, repair_adjacency, to_provider_messages, tool_definitions,
};
use emissary::models::{delegate_tool_name, Message};
use emissary::{Agent, ContentBlock, FnTool, Role, ToolRegistry};

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn message_at(role: Role, content: Vec<ContentBlock>, offset_s: i64) -> Message {
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
        created_at: Utc::now() + Duration::seconds(offset_s),
    }
}

fn agent_with(tools: Vec<String>, delegates: Vec<Uuid>) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        name: "assistant".to_string(),
        model: "claude-sonnet-4-20250514".to_string(),
        system_prompt: "be helpful".to_string(),
        tools,
        agent_ids: delegates,
        max_tokens: Some(2048),
        temperature: Some(0.5),
        top_k: None,
        top_p: None,
        metadata: json!({}),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn registry_with_echo() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(FnTool::new(
            "echo",
            "Echo the input back",
            json!({
                "type": "object",
                "properties": {"input": {"type": "string"}},
                "required": ["input"]
            }),
            |_ctx, input| async move {
                Ok(input
                    .get("input")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string())
            },
        )))
        .unwrap();
    registry
}

/// The S2 conversation shape: prompt, tool_use, tool_result, final answer.
#[test]
fn one_tool_call_conversation_is_provider_clean() {
    let messages = vec![
        message_at(Role::User, vec![ContentBlock::text("say hi using echo")], 0),
        message_at(
            Role::Assistant,
            vec![
                ContentBlock::text("calling echo"),
                ContentBlock::ToolUse {
                    id: "tu_1".into(),
                    name: "echo".into(),
                    input: json!({"input": "hi"}),
                },
            ],
            1,
        ),
        message_at(
            Role::User,
            vec![ContentBlock::tool_result("tu_1", "hi", false)],
            2,
        ),
        message_at(Role::Assistant, vec![ContentBlock::text("it said: hi")], 3),
    ];

    let turns = repair_adjacency(&messages);
    let provider_messages = to_provider_messages(&turns);

    assert_eq!(provider_messages.len(), 4);
    assert_eq!(provider_messages[0]["role"], "user");
    assert_eq!(provider_messages[1]["content"][1]["type"], "tool_use");
    assert_eq!(
        provider_messages[2]["content"][0]["tool_use_id"],
        "tu_1"
    );
}

/// A crashed sibling run's dangling tool_use never reaches the provider.
#[test]
fn dangling_tool_use_from_dead_run_is_repaired_away() {
    let messages = vec![
        message_at(Role::User, vec![ContentBlock::text("first question")], 0),
        message_at(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: "tu_orphan".into(),
                name: "echo".into(),
                input: json!({}),
            }],
            1,
        ),
        message_at(Role::User, vec![ContentBlock::text("second question")], 2),
    ];

    let turns = repair_adjacency(&messages);
    let flat = serde_json::to_string(&to_provider_messages(&turns)).unwrap();
    assert!(!flat.contains("tu_orphan"));
}

#[test]
fn request_carries_agent_knobs_and_tools() {
    let registry = registry_with_echo();
    let agent = agent_with(vec!["echo".to_string()], vec![]);

    let tools = tool_definitions(&registry, &agent, &[]).unwrap();
    let request = build_request(&agent, vec![json!({"role": "user", "content": "hi"})], tools);

    assert_eq!(request.model, "claude-sonnet-4-20250514");
    assert_eq!(request.system.as_deref(), Some("be helpful"));
    assert_eq!(request.max_tokens, 2048);
    assert_eq!(request.temperature, Some(0.5));
    assert_eq!(request.tools.len(), 1);
    assert_eq!(request.tools[0]["name"], "echo");
}

#[test]
fn delegates_appear_as_task_tools() {
    let registry = registry_with_echo();
    let delegate = agent_with(vec![], vec![]);
    let mut delegate = delegate;
    delegate.name = "researcher".to_string();
    delegate.system_prompt = "dig deep".to_string();

    let agent = agent_with(vec!["echo".to_string()], vec![delegate.id]);
    let tools = tool_definitions(&registry, &agent, &[delegate.clone()]).unwrap();

    assert_eq!(tools.len(), 2);
    let delegate_def = &tools[1];
    assert_eq!(delegate_def["name"], delegate_tool_name("researcher"));
    assert_eq!(delegate_def["input_schema"]["required"][0], "task");
    assert!(delegate_def["description"]
        .as_str()
        .unwrap()
        .contains("dig deep"));
}

#[test]
fn missing_local_tool_is_a_validation_error() {
    let registry = ToolRegistry::new();
    let agent = agent_with(vec!["echo".to_string()], vec![]);
    assert!(tool_definitions(&registry, &agent, &[]).is_err());
}
