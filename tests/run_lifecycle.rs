//! Lifecycle logic tests that need no database
//!
//! Exercises the state machine, trigger selection, and tool-execution
//! fan-out exactly as the workers drive them.

use emissary::models::{state_for_stop_reason, Run, RunMode, RunState, TriggerType};
use emissary::workers::{next_trigger_type, tool_executions_from_content};
use emissary::{Agent, ContentBlock};

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

fn run_with(state: RunState, previous: Option<RunState>, iteration: i32) -> Run {
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
        prompt: "2+2".to_string(),
        variables: json!({}),
        response_text: None,
        current_iteration: iteration,
        current_iteration_id: Some(Uuid::new_v4()),
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

fn agent_named(name: &str) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        name: name.to_string(),
        model: "claude-sonnet-4-20250514".to_string(),
        system_prompt: String::new(),
        tools: vec![],
        agent_ids: vec![],
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
fn batch_state_machine_path() {
    // The happy path walks pending -> batch_submitting -> batch_pending ->
    // batch_processing -> completed.
    assert_eq!(RunState::claimed_state(RunMode::Batch), RunState::BatchSubmitting);
    assert!(!RunState::BatchPending.is_terminal());
    assert!(!RunState::BatchProcessing.is_terminal());
    assert_eq!(state_for_stop_reason(Some("end_turn")), RunState::Completed);
}

#[test]
fn streaming_collapses_batch_states() {
    assert_eq!(RunState::claimed_state(RunMode::Streaming), RunState::Streaming);
}

#[test]
fn tool_use_round_trips_through_pending_tools() {
    assert_eq!(state_for_stop_reason(Some("tool_use")), RunState::PendingTools);
    // After the guarded transition, a claim from pending_api carries tool
    // results into the next iteration.
    let run = run_with(RunState::BatchSubmitting, Some(RunState::PendingApi), 1);
    assert_eq!(next_trigger_type(&run), TriggerType::ToolResults);
}

#[test]
fn first_claim_persists_the_user_prompt() {
    let run = run_with(RunState::BatchSubmitting, Some(RunState::Pending), 0);
    assert_eq!(next_trigger_type(&run), TriggerType::UserPrompt);
}

#[test]
fn reclaim_after_rescue_is_a_continuation() {
    let run = run_with(RunState::BatchSubmitting, Some(RunState::Pending), 3);
    assert_eq!(next_trigger_type(&run), TriggerType::Continuation);
}

#[test]
fn pause_reasons_park_the_run() {
    assert_eq!(state_for_stop_reason(Some("max_tokens")), RunState::AwaitingInput);
    assert_eq!(state_for_stop_reason(Some("pause_turn")), RunState::AwaitingInput);
}

#[test]
fn refusal_fails_and_unknown_completes() {
    assert_eq!(state_for_stop_reason(Some("refusal")), RunState::Failed);
    assert_eq!(state_for_stop_reason(Some("model_context_window_exceeded")), RunState::Completed);
}

#[test]
fn delegate_tool_use_becomes_agent_execution() {
    let delegate = agent_named("summarizer");
    let delegate_id = delegate.id;

    let content = vec![ContentBlock::ToolUse {
        id: "tu_1".to_string(),
        name: "agent__summarizer".to_string(),
        input: json!({"task": "condense this"}),
    }];

    let execs = tool_executions_from_content(&content, &[delegate], 3);
    assert_eq!(execs.len(), 1);
    assert!(execs[0].is_agent_tool);
    assert_eq!(execs[0].agent_id, Some(delegate_id));
    // Child-run failures surface to the parent instead of retrying.
    assert_eq!(execs[0].max_attempts, 1);
}

#[test]
fn unknown_delegate_name_falls_back_to_regular_tool() {
    let content = vec![ContentBlock::ToolUse {
        id: "tu_1".to_string(),
        name: "agent__stranger".to_string(),
        input: json!({"task": "?"}),
    }];

    let execs = tool_executions_from_content(&content, &[], 3);
    assert!(!execs[0].is_agent_tool);
    assert_eq!(execs[0].agent_id, None);
}
