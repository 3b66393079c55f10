//! Session history compaction
//!
//! Keeps a session's estimated token footprint under the model's context
//! budget. The hybrid strategy prunes tool outputs first (no LLM call) and
//! only summarizes when pruning was not enough; the summarize strategy goes
//! straight to the model. Every pass archives what it touches and records an
//! audit event in the same transaction.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::config::CompactionConfig;
use crate::error::Result;
use crate::models::message::content_to_value;
use crate::models::{CompactionEvent, CompactionStrategy, ContentBlock, Message, Role};
use crate::provider::{CompletionProvider, ProviderRequest};
use crate::store::{CompactionPlan, Store};

/// Placeholder a pruned tool result collapses to
pub const PRUNED_PLACEHOLDER: &str = "[tool output pruned]";

/// Cheap token estimate: about four characters per token. Real counting is
/// a provider concern; compaction only needs a stable budget signal.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() as i64 + 3) / 4
}

/// Estimated footprint of one message
pub fn estimate_message_tokens(message: &Message) -> i64 {
    estimate_tokens(&content_to_value(&message.content).to_string())
}

/// Estimated footprint of a whole history
pub fn estimate_history_tokens(messages: &[Message]) -> i64 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Which compaction class a message falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Inside the trailing protected-token window
    Protected,
    /// Flagged never-compactable
    Preserved,
    /// One of the last N messages
    Recent,
    /// A summary from an earlier pass
    Summary,
    /// Fair game
    Compactable,
}

/// Partition a history into mutually exclusive compaction classes, oldest
/// first, aligned with the input order
pub fn partition_messages(messages: &[Message], config: &CompactionConfig) -> Vec<Partition> {
    let len = messages.len();

    // Trailing token window, accumulated from the newest message backwards.
    let mut protected = vec![false; len];
    let mut window = 0i64;
    for i in (0..len).rev() {
        window += estimate_message_tokens(&messages[i]);
        protected[i] = true;
        if window >= config.protected_tokens {
            break;
        }
    }

    messages
        .iter()
        .enumerate()
        .map(|(i, message)| {
            if message.is_preserved {
                Partition::Preserved
            } else if message.is_summary {
                Partition::Summary
            } else if i + config.preserve_last_n >= len {
                Partition::Recent
            } else if protected[i] {
                Partition::Protected
            } else {
                Partition::Compactable
            }
        })
        .collect()
}

/// Phase 1: rewrite tool_result blocks in a compactable message to the fixed
/// placeholder. Returns the new content if anything shrank.
pub fn prune_tool_results(message: &Message) -> Option<Vec<ContentBlock>> {
    let mut changed = false;
    let content: Vec<ContentBlock> = message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } if content.len() > PRUNED_PLACEHOLDER.len() => {
                changed = true;
                ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: PRUNED_PLACEHOLDER.to_string(),
                    is_error: *is_error,
                }
            }
            other => other.clone(),
        })
        .collect();

    changed.then_some(content)
}

/// Render the compactable span for the summarizer
fn summarization_prompt(messages: &[Message]) -> String {
    let mut excerpt = String::new();
    for message in messages {
        let role = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        let text = message.text();
        if text.is_empty() {
            continue;
        }
        excerpt.push_str(role);
        excerpt.push_str(": ");
        excerpt.push_str(&text);
        excerpt.push('\n');
    }

    format!(
        "Summarize the following conversation excerpt so a later turn can \
         continue seamlessly. Keep decisions, facts, names, numbers, and \
         unresolved questions; drop pleasantries and dead ends. Reply with \
         the summary only.\n\n{}",
        excerpt
    )
}

/// Runs compaction passes against sessions
pub struct Compactor {
    store: Store,
    provider: Arc<dyn CompletionProvider>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(store: Store, provider: Arc<dyn CompletionProvider>, config: CompactionConfig) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Compact if the session is over its trigger threshold. Called after
    /// run completion; a `None` means the session still fits.
    pub async fn maybe_compact(&self, session_id: Uuid) -> Result<Option<CompactionEvent>> {
        let messages = self.store.get_session_messages(session_id).await?;
        let tokens = estimate_history_tokens(&messages);
        let threshold =
            (self.config.trigger_ratio * self.config.max_context_tokens as f64) as i64;

        if tokens < threshold {
            return Ok(None);
        }

        tracing::info!(
            session_id = %session_id,
            tokens = tokens,
            threshold = threshold,
            "Session over token budget, compacting"
        );

        self.compact(session_id, CompactionStrategy::Hybrid).await
    }

    /// Run one compaction pass with an explicit strategy (on-demand API)
    pub async fn compact(
        &self,
        session_id: Uuid,
        strategy: CompactionStrategy,
    ) -> Result<Option<CompactionEvent>> {
        let started = Instant::now();

        let messages = self.store.get_session_messages(session_id).await?;
        let tokens_before = estimate_history_tokens(&messages);
        let partitions = partition_messages(&messages, &self.config);

        let compactable: Vec<&Message> = messages
            .iter()
            .zip(&partitions)
            .filter(|(_, p)| **p == Partition::Compactable)
            .map(|(m, _)| m)
            .collect();

        if compactable.is_empty() {
            tracing::debug!(session_id = %session_id, "Nothing compactable");
            return Ok(None);
        }

        // Phase 1: prune tool outputs in place.
        let mut pruned: Vec<(Uuid, Vec<ContentBlock>)> = Vec::new();
        let mut tokens_after = tokens_before;
        if strategy == CompactionStrategy::Hybrid {
            for message in &compactable {
                if let Some(content) = prune_tool_results(message) {
                    tokens_after -= estimate_message_tokens(message);
                    tokens_after += estimate_tokens(&content_to_value(&content).to_string());
                    pruned.push((message.id, content));
                }
            }
        }

        // Phase 2: summarize the span if pruning was skipped or fell short.
        let mut removed: Vec<Uuid> = Vec::new();
        let mut summary: Option<String> = None;
        if tokens_after > self.config.target_tokens {
            let owned: Vec<Message> = compactable.iter().map(|m| (*m).clone()).collect();
            let prompt = summarization_prompt(&owned);

            let mut request = ProviderRequest::new(self.config.summary_model.clone());
            request.max_tokens = 2048;
            request.messages = vec![serde_json::json!({
                "role": "user",
                "content": prompt,
            })];

            let response = self.provider.complete(&request).await?;
            let text = response.text();

            removed = compactable.iter().map(|m| m.id).collect();
            for message in &compactable {
                tokens_after -= estimate_message_tokens(message);
            }
            tokens_after += estimate_tokens(&text);
            summary = Some(text);
            // Phase 2 removes these messages outright; in-place pruning of
            // the same rows would be wasted work.
            pruned.retain(|(id, _)| !removed.contains(id));
        }

        if pruned.is_empty() && removed.is_empty() {
            return Ok(None);
        }

        let plan = CompactionPlan {
            strategy,
            tokens_before,
            tokens_after,
            pruned,
            removed,
            summary,
            duration_ms: started.elapsed().as_millis() as i64,
        };

        let event = self.store.apply_compaction(session_id, &plan).await?;

        tracing::info!(
            session_id = %session_id,
            tokens_before = event.tokens_before,
            tokens_after = event.tokens_after,
            messages_removed = event.messages_removed,
            "Compaction applied"
        );

        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(role: Role, text: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            run_id: None,
            role,
            content: vec![ContentBlock::text(text)],
            is_preserved: false,
            is_summary: false,
            input_tokens: None,
            output_tokens: None,
            created_at: Utc::now(),
        }
    }

    fn small_config() -> CompactionConfig {
        CompactionConfig {
            trigger_ratio: 0.85,
            max_context_tokens: 1000,
            target_tokens: 500,
            protected_tokens: 50,
            preserve_last_n: 2,
            summary_model: "test-model".to_string(),
            auto_compact: true,
        }
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_partition_preserved_wins() {
        let mut m = message(Role::User, "keep me");
        m.is_preserved = true;
        let messages = vec![m];
        let partitions = partition_messages(&messages, &small_config());
        assert_eq!(partitions, vec![Partition::Preserved]);
    }

    #[test]
    fn test_partition_recent_tail() {
        let messages: Vec<Message> = (0..5)
            .map(|i| message(Role::User, &format!("message number {}", i)))
            .collect();
        let partitions = partition_messages(&messages, &small_config());
        // Last two are Recent (preserve_last_n = 2).
        assert_eq!(partitions[4], Partition::Recent);
        assert_eq!(partitions[3], Partition::Recent);
        assert_ne!(partitions[0], Partition::Recent);
    }

    #[test]
    fn test_partition_old_bulk_is_compactable() {
        let long = "x".repeat(600); // ~150 tokens, past the 50-token window
        let mut messages: Vec<Message> =
            (0..6).map(|_| message(Role::Assistant, &long)).collect();
        messages.push(message(Role::User, "latest"));
        let partitions = partition_messages(&messages, &small_config());
        assert_eq!(partitions[0], Partition::Compactable);
        assert_eq!(partitions[1], Partition::Compactable);
    }

    #[test]
    fn test_prune_rewrites_tool_results_only() {
        let mut m = message(Role::User, "context");
        m.content.push(ContentBlock::tool_result(
            "tu_1",
            "a very long tool output that should be pruned away entirely",
            false,
        ));

        let pruned = prune_tool_results(&m).unwrap();
        assert_eq!(pruned[0], ContentBlock::text("context"));
        assert_eq!(
            pruned[1],
            ContentBlock::tool_result("tu_1", PRUNED_PLACEHOLDER, false)
        );
    }

    #[test]
    fn test_prune_skips_short_outputs() {
        let mut m = message(Role::User, "context");
        m.content = vec![ContentBlock::tool_result("tu_1", "ok", false)];
        assert!(prune_tool_results(&m).is_none());
    }

    #[test]
    fn test_summarization_prompt_includes_roles() {
        let messages = vec![
            message(Role::User, "what is 2+2"),
            message(Role::Assistant, "4"),
        ];
        let prompt = summarization_prompt(&messages);
        assert!(prompt.contains("User: what is 2+2"));
        assert!(prompt.contains("Assistant: 4"));
    }
}
