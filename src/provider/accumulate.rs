//! Incremental assembly of a streamed message
//!
//! Consumes the ordered event sequence and produces the same
//! [`ProviderMessage`] a batch result would have carried, so the two paths
//! share every downstream step.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::models::{ContentBlock, TokenUsage};

use super::{ProviderMessage, StreamEvent};

/// One content block mid-assembly, keyed by stream index
#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
    Other(Value),
}

/// Accumulates stream events into a finished message
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    message_id: Option<String>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    open: BTreeMap<usize, PartialBlock>,
    finished: BTreeMap<usize, ContentBlock>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the accumulator
    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::MessageStart { message_id, usage } => {
                self.message_id = Some(message_id);
                self.usage = usage;
            }
            StreamEvent::ContentBlockStart { index, block } => {
                let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
                let partial = match block_type {
                    "text" => PartialBlock::Text(
                        block
                            .get("text")
                            .and_then(|t| t.as_str())
                            .unwrap_or("")
                            .to_string(),
                    ),
                    "tool_use" => PartialBlock::ToolUse {
                        id: block
                            .get("id")
                            .and_then(|s| s.as_str())
                            .unwrap_or("")
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|s| s.as_str())
                            .unwrap_or("")
                            .to_string(),
                        input_json: String::new(),
                    },
                    _ => PartialBlock::Other(block),
                };
                self.open.insert(index, partial);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let delta_type = delta.get("type").and_then(|t| t.as_str()).unwrap_or("");
                match (self.open.get_mut(&index), delta_type) {
                    (Some(PartialBlock::Text(text)), "text_delta") => {
                        if let Some(t) = delta.get("text").and_then(|t| t.as_str()) {
                            text.push_str(t);
                        }
                    }
                    (Some(PartialBlock::ToolUse { input_json, .. }), "input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(|p| p.as_str()) {
                            input_json.push_str(partial);
                        }
                    }
                    _ => {
                        tracing::debug!(
                            index = index,
                            delta_type = %delta_type,
                            "Ignoring delta for unknown block"
                        );
                    }
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                if let Some(partial) = self.open.remove(&index) {
                    self.finished.insert(index, finalize_block(partial));
                }
            }
            StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                self.usage.output_tokens = output_tokens;
            }
            StreamEvent::MessageStop | StreamEvent::Ping => {}
        }
    }

    /// Finish assembly. Blocks the stream never closed are finalized as-is.
    pub fn finish(mut self) -> ProviderMessage {
        let open = std::mem::take(&mut self.open);
        for (index, partial) in open {
            self.finished.insert(index, finalize_block(partial));
        }

        ProviderMessage {
            message_id: self.message_id,
            content: self.finished.into_values().collect(),
            stop_reason: self.stop_reason,
            usage: self.usage,
        }
    }
}

fn finalize_block(partial: PartialBlock) -> ContentBlock {
    match partial {
        PartialBlock::Text(text) => ContentBlock::Text { text },
        PartialBlock::ToolUse {
            id,
            name,
            input_json,
        } => {
            // Empty accumulated input must become {}, never null: the next
            // turn echoes this block back to the provider.
            let input = if input_json.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&input_json).unwrap_or_else(|_| json!({}))
            };
            ContentBlock::ToolUse { id, name, input }
        }
        PartialBlock::Other(v) => ContentBlock::Other(v),
    }
}
