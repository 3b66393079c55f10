//! LLM provider interface
//!
//! The engine consumes two provider capability sets: a deferred-batch API
//! (submit, poll status, fetch one request's result) and a streaming API
//! (ordered SSE event sequence). A third, plain single-shot completion, is
//! used only by the compaction summarizer. All three are traits so tests can
//! substitute in-memory fakes for the HTTP client.

mod accumulate;
mod anthropic;
mod sse;

pub use accumulate::MessageAccumulator;
pub use anthropic::AnthropicProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;

use crate::error::Result;
use crate::models::{BatchStatus, ContentBlock, TokenUsage};

pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// One LLM call, provider-shaped
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub system: Option<String>,
    /// Provider-shaped `{role, content}` objects
    pub messages: Vec<Value>,
    /// Provider-shaped tool definitions
    pub tools: Vec<Value>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub top_k: Option<i32>,
    pub top_p: Option<f64>,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: None,
            top_k: None,
            top_p: None,
        }
    }
}

/// A finished assistant message as returned by the provider
#[derive(Debug, Clone)]
pub struct ProviderMessage {
    pub message_id: Option<String>,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: TokenUsage,
}

impl ProviderMessage {
    /// Concatenated text blocks
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
}

/// Identifiers returned by a batch submission
#[derive(Debug, Clone)]
pub struct BatchHandle {
    pub batch_id: String,
    pub request_id: String,
}

/// Per-batch request tallies from a status poll
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchRequestCounts {
    pub processing: i64,
    pub succeeded: i64,
    pub errored: i64,
    pub canceled: i64,
    pub expired: i64,
}

/// Result of polling a batch's processing status
#[derive(Debug, Clone)]
pub struct BatchStatusInfo {
    pub status: BatchStatus,
    pub counts: BatchRequestCounts,
    pub expires_at: Option<DateTime<Utc>>,
    pub results_url: Option<String>,
}

/// Terminal result of one request within an ended batch
#[derive(Debug, Clone)]
pub enum BatchResult {
    Succeeded(ProviderMessage),
    Errored(String),
    Canceled,
    Expired,
}

/// Ordered streaming events:
/// `message_start -> (content_block_start -> content_block_delta* ->
/// content_block_stop)* -> message_delta -> message_stop`
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageStart {
        message_id: String,
        usage: TokenUsage,
    },
    ContentBlockStart {
        index: usize,
        block: Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: Value,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<String>,
        output_tokens: i64,
    },
    MessageStop,
    Ping,
}

/// Deferred-batch capability
#[async_trait]
pub trait BatchProvider: Send + Sync {
    /// Submit a single-request batch; `custom_id` correlates the result
    async fn submit_batch(
        &self,
        custom_id: &str,
        request: &ProviderRequest,
    ) -> Result<BatchHandle>;

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatusInfo>;

    /// Fetch one request's result from an ended batch
    async fn get_batch_result(&self, batch_id: &str, request_id: &str) -> Result<BatchResult>;
}

/// Streaming capability
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    async fn open_stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}

/// Plain single-shot completion (compaction summaries)
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderMessage>;
}
