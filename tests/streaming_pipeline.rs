//! Streaming accumulation driven with the full provider event sequence

use emissary::models::state_for_stop_reason;
use emissary::provider::{MessageAccumulator, StreamEvent};
use emissary::{ContentBlock, RunState, TokenUsage};

use serde_json::json;

/// The ordered event sequence the provider contract guarantees:
/// message_start, blocks, message_delta, message_stop.
fn tool_call_stream() -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            message_id: "msg_stream".to_string(),
            usage: TokenUsage {
                input_tokens: 30,
                cache_read_tokens: 8,
                ..Default::default()
            },
        },
        StreamEvent::ContentBlockStart {
            index: 0,
            block: json!({"type": "text", "text": ""}),
        },
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: json!({"type": "text_delta", "text": "let me echo that"}),
        },
        StreamEvent::ContentBlockStop { index: 0 },
        StreamEvent::ContentBlockStart {
            index: 1,
            block: json!({"type": "tool_use", "id": "tu_9", "name": "echo", "input": {}}),
        },
        StreamEvent::ContentBlockDelta {
            index: 1,
            delta: json!({"type": "input_json_delta", "partial_json": "{\"input\":"}),
        },
        StreamEvent::ContentBlockDelta {
            index: 1,
            delta: json!({"type": "input_json_delta", "partial_json": " \"hi\"}"}),
        },
        StreamEvent::ContentBlockStop { index: 1 },
        StreamEvent::MessageDelta {
            stop_reason: Some("tool_use".to_string()),
            output_tokens: 17,
        },
        StreamEvent::MessageStop,
    ]
}

#[test]
fn full_stream_produces_tool_round() {
    let mut accumulator = MessageAccumulator::new();
    for event in tool_call_stream() {
        accumulator.apply(event);
    }
    let message = accumulator.finish();

    assert_eq!(message.message_id.as_deref(), Some("msg_stream"));
    assert_eq!(message.text(), "let me echo that");
    assert_eq!(
        message.content[1],
        ContentBlock::ToolUse {
            id: "tu_9".to_string(),
            name: "echo".to_string(),
            input: json!({"input": "hi"}),
        }
    );

    // Usage merges message_start input counters with message_delta output.
    assert_eq!(message.usage.input_tokens, 30);
    assert_eq!(message.usage.cache_read_tokens, 8);
    assert_eq!(message.usage.output_tokens, 17);

    // And the stop reason drives the state machine into the tool round.
    assert_eq!(
        state_for_stop_reason(message.stop_reason.as_deref()),
        RunState::PendingTools
    );
}

#[test]
fn interrupted_stream_still_yields_partial_text() {
    let mut accumulator = MessageAccumulator::new();
    let events = tool_call_stream();
    // Drop everything after the first text delta.
    for event in events.into_iter().take(3) {
        accumulator.apply(event);
    }
    let message = accumulator.finish();

    assert_eq!(message.text(), "let me echo that");
    assert_eq!(message.stop_reason, None);
    // No stop reason maps to a failed run, not a silent completion.
    assert_eq!(state_for_stop_reason(None), RunState::Failed);
}
