//! Compaction partitioning and pruning tests

use emissary::compaction::{
    estimate_history_tokens, estimate_tokens, partition_messages, prune_tool_results, Partition,
    PRUNED_PLACEHOLDER,
};
use emissary::models::Message;
use emissary::{CompactionConfig, ContentBlock, Role};

use chrono::{Duration, Utc};
use uuid::Uuid;

fn message_at(content: Vec<ContentBlock>, offset_s: i64) -> Message {
    Message {
        id: Uuid::new_v4(),
        session_id: Uuid::new_v4(),
        run_id: None,
        role: Role::Assistant,
        content,
        is_preserved: false,
        is_summary: false,
        input_tokens: None,
        output_tokens: None,
        created_at: Utc::now() + Duration::seconds(offset_s),
    }
}

fn config() -> CompactionConfig {
    CompactionConfig {
        trigger_ratio: 0.85,
        max_context_tokens: 2000,
        target_tokens: 1000,
        protected_tokens: 100,
        preserve_last_n: 3,
        summary_model: "test-model".to_string(),
        auto_compact: true,
    }
}

fn long_text(chars: usize) -> String {
    "x".repeat(chars)
}

#[test]
fn partitions_are_mutually_exclusive_and_total() {
    let mut messages: Vec<Message> = (0..20)
        .map(|i| message_at(vec![ContentBlock::text(long_text(400))], i))
        .collect();
    messages[2].is_preserved = true;
    messages[5].is_summary = true;

    let partitions = partition_messages(&messages, &config());
    assert_eq!(partitions.len(), messages.len());

    assert_eq!(partitions[2], Partition::Preserved);
    assert_eq!(partitions[5], Partition::Summary);
    for p in &partitions[17..] {
        assert_eq!(*p, Partition::Recent);
    }
    // Old bulk outside every protected class is compactable.
    assert_eq!(partitions[0], Partition::Compactable);
    assert_eq!(partitions[10], Partition::Compactable);
}

#[test]
fn preserved_flag_beats_recency_window() {
    let mut messages: Vec<Message> = (0..4)
        .map(|i| message_at(vec![ContentBlock::text("short")], i))
        .collect();
    messages[3].is_preserved = true;

    let partitions = partition_messages(&messages, &config());
    assert_eq!(partitions[3], Partition::Preserved);
}

#[test]
fn pruning_shrinks_only_tool_results() {
    let message = message_at(
        vec![
            ContentBlock::text("analysis"),
            ContentBlock::tool_result("tu_1", long_text(5000), false),
            ContentBlock::tool_result("tu_2", long_text(5000), true),
        ],
        0,
    );

    let before = estimate_history_tokens(std::slice::from_ref(&message));
    let pruned = prune_tool_results(&message).unwrap();

    assert_eq!(pruned[0], ContentBlock::text("analysis"));
    assert_eq!(
        pruned[1],
        ContentBlock::tool_result("tu_1", PRUNED_PLACEHOLDER, false)
    );
    // Error flags survive pruning so the agent's feedback stays honest.
    assert_eq!(
        pruned[2],
        ContentBlock::tool_result("tu_2", PRUNED_PLACEHOLDER, true)
    );

    let mut rewritten = message.clone();
    rewritten.content = pruned;
    let after = estimate_history_tokens(std::slice::from_ref(&rewritten));
    assert!(after < before / 10);
}

#[test]
fn token_estimate_tracks_content_size() {
    assert_eq!(estimate_tokens(""), 0);
    assert!(estimate_tokens(&long_text(4000)) >= 1000);

    let small = message_at(vec![ContentBlock::text("hi")], 0);
    let big = message_at(vec![ContentBlock::text(long_text(4000))], 0);
    assert!(
        estimate_history_tokens(&[big]) > estimate_history_tokens(&[small]) * 100
    );
}
