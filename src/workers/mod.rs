//! Background workers
//!
//! Each worker is a long-running task owned by the coordinator: claim-based
//! run drivers (batch and streaming), the batch poller, the tool worker, and
//! the liveness machinery (heartbeat, leader election, rescuer). Workers wake
//! on notification or poll tick and always sweep the database, so a lost
//! notification never loses work.

pub mod batch_poller;
pub mod heartbeat;
pub mod leader;
pub mod rescuer;
pub mod run_worker;
pub mod streaming_worker;
pub mod tool_worker;

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::compaction::Compactor;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::history;
use crate::models::{
    delegate_tool_name, Agent, ContentBlock, Run, RunErrorKind, RunState, TriggerType,
};
use crate::notify::WorkerSignals;
use crate::provider::{BatchProvider, ProviderRequest, StreamingProvider};
use crate::store::{NewToolExecution, Store};
use crate::tools::ToolRegistry;

/// Everything a worker needs, shared by reference
pub struct WorkerContext {
    pub store: Store,
    pub config: Config,
    pub instance_id: Uuid,
    pub registry: Arc<ToolRegistry>,
    pub batch_provider: Arc<dyn BatchProvider>,
    pub streaming_provider: Arc<dyn StreamingProvider>,
    pub compactor: Arc<Compactor>,
    pub signals: WorkerSignals,
}

/// A claimed run with everything resolved and the provider request built
pub struct PreparedIteration {
    pub agent: Agent,
    pub delegates: Vec<Agent>,
    pub trigger_type: TriggerType,
    pub iteration_number: i32,
    pub request: ProviderRequest,
}

/// Which trigger the next iteration of a freshly claimed run carries
pub fn next_trigger_type(run: &Run) -> TriggerType {
    if run.previous_state == Some(RunState::PendingApi) {
        TriggerType::ToolResults
    } else if run.current_iteration == 0 {
        TriggerType::UserPrompt
    } else {
        TriggerType::Continuation
    }
}

/// Resolve agent and delegates, materialize this round's input message, and
/// build the provider request. Shared by the batch and streaming drivers.
///
/// Validation failures come back as [`Error::NotFound`] (agent) or
/// [`Error::Validation`] (tool); callers map them to `agent_not_found` /
/// `tool_not_found` run failures.
pub async fn prepare_iteration(ctx: &WorkerContext, run: &Run) -> Result<PreparedIteration> {
    let agent = ctx.store.get_agent(run.agent_id).await?;
    let delegates = ctx.store.get_agents(&agent.agent_ids).await?;

    let trigger_type = next_trigger_type(run);

    match trigger_type {
        TriggerType::UserPrompt => {
            ctx.store
                .insert_message(
                    run.session_id,
                    Some(run.id),
                    crate::models::Role::User,
                    &[ContentBlock::text(run.prompt.clone())],
                )
                .await?;
        }
        TriggerType::ToolResults => {
            let iteration_id = run.current_iteration_id.ok_or_else(|| {
                Error::Other(format!("run {} has tool results but no iteration", run.id))
            })?;
            let executions = ctx
                .store
                .get_tool_executions_for_iteration(iteration_id)
                .await?;
            let content = history::tool_results_content(&executions);
            if content.is_empty() {
                return Err(Error::Other(format!(
                    "run {} reached pending_api with no tool executions",
                    run.id
                )));
            }
            ctx.store
                .insert_message(run.session_id, Some(run.id), crate::models::Role::User, &content)
                .await?;
        }
        // Continuation prompts were appended when the caller continued the
        // run; rescued runs resubmit their existing context.
        TriggerType::Continuation => {}
    }

    let messages = ctx
        .store
        .get_context_messages(run.session_id, run.id)
        .await?;
    let turns = history::repair_adjacency(&messages);
    let provider_messages = history::to_provider_messages(&turns);

    let tools = history::tool_definitions(&ctx.registry, &agent, &delegates)?;
    let request = history::build_request(&agent, provider_messages, tools);

    Ok(PreparedIteration {
        agent,
        delegates,
        trigger_type,
        iteration_number: run.current_iteration + 1,
        request,
    })
}

/// Turn a response's tool_use blocks into pending tool-execution rows,
/// resolving delegate tools to their agent ids
pub fn tool_executions_from_content(
    content: &[ContentBlock],
    delegates: &[Agent],
    max_attempts: i32,
) -> Vec<NewToolExecution> {
    let delegate_ids: HashMap<String, Uuid> = delegates
        .iter()
        .map(|d| (delegate_tool_name(&d.name), d.id))
        .collect();

    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => {
                let agent_id = delegate_ids.get(name).copied();
                Some(NewToolExecution {
                    tool_use_id: id.clone(),
                    tool_name: name.clone(),
                    input: input.clone(),
                    is_agent_tool: agent_id.is_some(),
                    agent_id,
                    // Delegate failures surface to the parent, not the retry
                    // loop.
                    max_attempts: if agent_id.is_some() { 1 } else { max_attempts },
                })
            }
            _ => None,
        })
        .collect()
}

/// Map a preparation error onto the run failure it should record
pub fn preparation_failure(error: &Error) -> (RunErrorKind, String) {
    match error {
        Error::NotFound(message) => (RunErrorKind::AgentNotFound, message.clone()),
        Error::Validation(message) => (RunErrorKind::ToolNotFound, message.clone()),
        other => (RunErrorKind::BatchSubmitError, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunMode;
    use chrono::Utc;
    use serde_json::json;

    fn run_in(state: RunState, previous: Option<RunState>, iteration: i32) -> Run {
        Run {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            parent_run_id: None,
            parent_tool_execution_id: None,
            depth: 0,
            state,
            previous_state: previous,
            run_mode: RunMode::Batch,
            prompt: "hello".to_string(),
            variables: json!({}),
            response_text: None,
            current_iteration: iteration,
            current_iteration_id: None,
            iteration_count: iteration,
            tool_iterations: 0,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            error_type: None,
            error_message: None,
            claimed_by_instance_id: None,
            claimed_at: None,
            rescue_attempts: 0,
            last_rescue_at: None,
            finalized_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn agent(name: &str) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: name.to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            system_prompt: String::new(),
            tools: Vec::new(),
            agent_ids: Vec::new(),
            max_tokens: None,
            temperature: None,
            top_k: None,
            top_p: None,
            metadata: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_trigger_selection() {
        let fresh = run_in(RunState::BatchSubmitting, Some(RunState::Pending), 0);
        assert_eq!(next_trigger_type(&fresh), TriggerType::UserPrompt);

        let after_tools = run_in(RunState::BatchSubmitting, Some(RunState::PendingApi), 2);
        assert_eq!(next_trigger_type(&after_tools), TriggerType::ToolResults);

        let continued = run_in(RunState::BatchSubmitting, Some(RunState::Pending), 2);
        assert_eq!(next_trigger_type(&continued), TriggerType::Continuation);
    }

    #[test]
    fn test_tool_executions_from_content() {
        let delegate = agent("researcher");
        let delegate_id = delegate.id;

        let content = vec![
            ContentBlock::text("working on it"),
            ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "echo".into(),
                input: json!({"input": "hi"}),
            },
            ContentBlock::ToolUse {
                id: "tu_2".into(),
                name: "agent__researcher".into(),
                input: json!({"task": "look this up"}),
            },
        ];

        let execs = tool_executions_from_content(&content, &[delegate], 3);
        assert_eq!(execs.len(), 2);

        assert_eq!(execs[0].tool_name, "echo");
        assert!(!execs[0].is_agent_tool);
        assert_eq!(execs[0].agent_id, None);
        assert_eq!(execs[0].max_attempts, 3);

        assert_eq!(execs[1].tool_name, "agent__researcher");
        assert!(execs[1].is_agent_tool);
        assert_eq!(execs[1].agent_id, Some(delegate_id));
        assert_eq!(execs[1].max_attempts, 1);
    }

    #[test]
    fn test_preparation_failure_mapping() {
        let (kind, _) = preparation_failure(&Error::NotFound("Agent not found: x".into()));
        assert_eq!(kind, RunErrorKind::AgentNotFound);

        let (kind, _) = preparation_failure(&Error::Validation("tool missing".into()));
        assert_eq!(kind, RunErrorKind::ToolNotFound);
    }
}
