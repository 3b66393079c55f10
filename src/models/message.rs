//! Message model and typed content blocks
//!
//! Content is stored as a JSONB array of provider-shaped blocks. Known block
//! kinds get typed variants; anything else is carried verbatim so
//! provider-specific blocks survive a round trip through the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// One typed content block within a message
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Image {
        source: Value,
    },
    Document {
        source: Value,
    },
    /// Provider-specific block preserved verbatim (e.g. thinking blocks)
    Other(Value),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    /// Parse a provider-shaped block. Unknown `type` values are kept raw.
    pub fn from_value(v: &Value) -> ContentBlock {
        let block_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match block_type {
            "text" => ContentBlock::Text {
                text: v
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_string(),
            },
            "tool_use" => ContentBlock::ToolUse {
                id: v.get("id").and_then(|s| s.as_str()).unwrap_or("").to_string(),
                name: v
                    .get("name")
                    .and_then(|s| s.as_str())
                    .unwrap_or("")
                    .to_string(),
                input: v.get("input").cloned().unwrap_or_else(|| json!({})),
            },
            "tool_result" => ContentBlock::ToolResult {
                tool_use_id: v
                    .get("tool_use_id")
                    .and_then(|s| s.as_str())
                    .unwrap_or("")
                    .to_string(),
                content: match v.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
                is_error: v.get("is_error").and_then(|b| b.as_bool()).unwrap_or(false),
            },
            "image" => ContentBlock::Image {
                source: v.get("source").cloned().unwrap_or(Value::Null),
            },
            "document" => ContentBlock::Document {
                source: v.get("source").cloned().unwrap_or(Value::Null),
            },
            _ => ContentBlock::Other(v.clone()),
        }
    }

    /// Serialize back to the provider-shaped JSON object
    pub fn to_value(&self) -> Value {
        match self {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::ToolUse { id, name, input } => {
                json!({"type": "tool_use", "id": id, "name": name, "input": input})
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
            ContentBlock::Image { source } => json!({"type": "image", "source": source}),
            ContentBlock::Document { source } => json!({"type": "document", "source": source}),
            ContentBlock::Other(v) => v.clone(),
        }
    }
}

/// Parse a JSONB content column into typed blocks
pub fn content_from_value(v: &Value) -> Vec<ContentBlock> {
    match v {
        Value::Array(items) => items.iter().map(ContentBlock::from_value).collect(),
        // A bare string is shorthand for a single text block
        Value::String(s) => vec![ContentBlock::text(s.clone())],
        _ => Vec::new(),
    }
}

/// Serialize typed blocks back to the JSONB content column
pub fn content_to_value(blocks: &[ContentBlock]) -> Value {
    Value::Array(blocks.iter().map(ContentBlock::to_value).collect())
}

/// Message model
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub run_id: Option<Uuid>,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub is_preserved: bool,
    pub is_summary: bool,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All tool_use blocks, in order
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_round_trip() {
        let blocks = vec![
            ContentBlock::text("hello"),
            ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "echo".into(),
                input: json!({"input": "hi"}),
            },
            ContentBlock::tool_result("tu_1", "hi", false),
        ];
        let v = content_to_value(&blocks);
        let parsed = content_from_value(&v);
        assert_eq!(parsed, blocks);
    }

    #[test]
    fn test_unknown_block_preserved_verbatim() {
        let raw = json!([{"type": "thinking", "thinking": "...", "signature": "abc"}]);
        let parsed = content_from_value(&raw);
        assert_eq!(parsed.len(), 1);
        assert!(matches!(parsed[0], ContentBlock::Other(_)));
        assert_eq!(content_to_value(&parsed), raw);
    }

    #[test]
    fn test_bare_string_content() {
        let parsed = content_from_value(&json!("just text"));
        assert_eq!(parsed, vec![ContentBlock::text("just text")]);
    }

    #[test]
    fn test_tool_result_structured_content_stringified() {
        let raw = json!([{"type": "tool_result", "tool_use_id": "t1", "content": {"a": 1}}]);
        let parsed = content_from_value(&raw);
        match &parsed[0] {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert_eq!(content, "{\"a\":1}");
                assert!(!is_error);
            }
            other => panic!("unexpected block: {:?}", other),
        }
    }
}
