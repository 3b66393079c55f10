//! Anthropic Messages API adapter
//!
//! Implements all three provider capabilities against the native API:
//! single-shot messages, the Message Batches API for deferred runs, and SSE
//! streaming. System prompts go in the top-level `system` field and tool
//! results travel as user messages with `tool_result` content blocks.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::models::message::content_from_value;
use crate::models::{BatchStatus, TokenUsage};

use super::sse::sse_response_stream;
use super::{
    BatchHandle, BatchProvider, BatchRequestCounts, BatchResult, BatchStatusInfo, BoxStream,
    CompletionProvider, ProviderMessage, ProviderRequest, StreamEvent, StreamingProvider,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Provider adapter for the Anthropic Messages API
pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Point the adapter at a different endpoint (proxies, test doubles)
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    fn authed_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn authed_get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    async fn read_error(response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Error::Provider(format!("HTTP {} - {}", status.as_u16(), body))
    }
}

/// Build the `params` object shared by direct and batched message calls
fn build_params(request: &ProviderRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": request.messages,
        "max_tokens": request.max_tokens,
    });

    if stream {
        body["stream"] = json!(true);
    }
    if let Some(system) = &request.system {
        if !system.is_empty() {
            body["system"] = json!(system);
        }
    }
    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_k) = request.top_k {
        body["top_k"] = json!(top_k);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }

    body
}

fn parse_usage(v: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: v.get("input_tokens").and_then(|t| t.as_i64()).unwrap_or(0),
        output_tokens: v.get("output_tokens").and_then(|t| t.as_i64()).unwrap_or(0),
        cache_creation_tokens: v
            .get("cache_creation_input_tokens")
            .and_then(|t| t.as_i64())
            .unwrap_or(0),
        cache_read_tokens: v
            .get("cache_read_input_tokens")
            .and_then(|t| t.as_i64())
            .unwrap_or(0),
    }
}

/// Parse a complete message object into the engine's shape
fn parse_message(body: &Value) -> ProviderMessage {
    ProviderMessage {
        message_id: body
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        content: body
            .get("content")
            .map(content_from_value)
            .unwrap_or_default(),
        stop_reason: body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        usage: body.get("usage").map(parse_usage).unwrap_or_default(),
    }
}

fn parse_batch_status(s: &str) -> Result<BatchStatus> {
    s.parse()
        .map_err(|_| Error::Provider(format!("unknown batch processing status '{}'", s)))
}

/// Parse one SSE data payload into stream events
fn parse_sse_data(data: &str) -> Vec<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Serialization(e))],
    };

    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "message_start" => {
            let message = v.get("message").cloned().unwrap_or_default();
            vec![Ok(StreamEvent::MessageStart {
                message_id: message
                    .get("id")
                    .and_then(|s| s.as_str())
                    .unwrap_or("")
                    .to_string(),
                usage: message.get("usage").map(parse_usage).unwrap_or_default(),
            })]
        }
        "content_block_start" => {
            let index = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
            let block = v.get("content_block").cloned().unwrap_or_default();
            vec![Ok(StreamEvent::ContentBlockStart { index, block })]
        }
        "content_block_delta" => {
            let index = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
            let delta = v.get("delta").cloned().unwrap_or_default();
            vec![Ok(StreamEvent::ContentBlockDelta { index, delta })]
        }
        "content_block_stop" => {
            let index = v.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
            vec![Ok(StreamEvent::ContentBlockStop { index })]
        }
        "message_delta" => {
            let stop_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|s| s.as_str())
                .map(|s| s.to_string());
            let output_tokens = v
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|t| t.as_i64())
                .unwrap_or(0);
            vec![Ok(StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            })]
        }
        "message_stop" => vec![Ok(StreamEvent::MessageStop)],
        "ping" => vec![Ok(StreamEvent::Ping)],
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown stream error");
            vec![Err(Error::Provider(message.to_string()))]
        }
        _ => Vec::new(),
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderMessage> {
        let body = build_params(request, false);

        tracing::debug!(model = %request.model, "anthropic message request");

        let response = self.authed_post("/v1/messages").json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let body: Value = response.json().await?;
        Ok(parse_message(&body))
    }
}

#[async_trait]
impl BatchProvider for AnthropicProvider {
    async fn submit_batch(
        &self,
        custom_id: &str,
        request: &ProviderRequest,
    ) -> Result<BatchHandle> {
        let body = json!({
            "requests": [{
                "custom_id": custom_id,
                "params": build_params(request, false),
            }]
        });

        tracing::debug!(model = %request.model, custom_id = %custom_id, "anthropic batch submit");

        let response = self
            .authed_post("/v1/messages/batches")
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let body: Value = response.json().await?;
        let batch_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Provider("batch response missing id".to_string()))?
            .to_string();

        Ok(BatchHandle {
            batch_id,
            request_id: custom_id.to_string(),
        })
    }

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatusInfo> {
        let url = format!("{}/v1/messages/batches/{}", self.base_url, batch_id);
        let response = self.authed_get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        let body: Value = response.json().await?;
        let status = body
            .get("processing_status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Provider("batch status missing processing_status".to_string()))
            .and_then(parse_batch_status)?;

        let counts = body
            .get("request_counts")
            .map(|c| BatchRequestCounts {
                processing: c.get("processing").and_then(|v| v.as_i64()).unwrap_or(0),
                succeeded: c.get("succeeded").and_then(|v| v.as_i64()).unwrap_or(0),
                errored: c.get("errored").and_then(|v| v.as_i64()).unwrap_or(0),
                canceled: c.get("canceled").and_then(|v| v.as_i64()).unwrap_or(0),
                expired: c.get("expired").and_then(|v| v.as_i64()).unwrap_or(0),
            })
            .unwrap_or_default();

        let expires_at = body
            .get("expires_at")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        let results_url = body
            .get("results_url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(BatchStatusInfo {
            status,
            counts,
            expires_at,
            results_url,
        })
    }

    async fn get_batch_result(&self, batch_id: &str, request_id: &str) -> Result<BatchResult> {
        let status = self.get_batch_status(batch_id).await?;
        let results_url = status.results_url.ok_or_else(|| {
            Error::Provider(format!("batch {} has no results to download yet", batch_id))
        })?;

        // Results arrive as JSONL, one line per request.
        let response = self.authed_get(&results_url).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        let body = response.text().await?;

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: Value = serde_json::from_str(line)?;
            if entry.get("custom_id").and_then(|v| v.as_str()) != Some(request_id) {
                continue;
            }

            let result = entry
                .get("result")
                .ok_or_else(|| Error::Provider("batch result entry missing result".to_string()))?;
            let result_type = result.get("type").and_then(|v| v.as_str()).unwrap_or("");

            return match result_type {
                "succeeded" => {
                    let message = result.get("message").ok_or_else(|| {
                        Error::Provider("succeeded result missing message".to_string())
                    })?;
                    Ok(BatchResult::Succeeded(parse_message(message)))
                }
                "errored" => {
                    let message = result
                        .get("error")
                        .and_then(|e| e.get("error"))
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .unwrap_or("batch request errored");
                    Ok(BatchResult::Errored(message.to_string()))
                }
                "canceled" => Ok(BatchResult::Canceled),
                "expired" => Ok(BatchResult::Expired),
                other => Err(Error::Provider(format!(
                    "unknown batch result type '{}'",
                    other
                ))),
            };
        }

        Err(Error::Provider(format!(
            "batch {} results do not contain request {}",
            batch_id, request_id
        )))
    }
}

#[async_trait]
impl StreamingProvider for AnthropicProvider {
    async fn open_stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = build_params(request, true);

        tracing::debug!(model = %request.model, "anthropic stream request");

        let response = self.authed_post("/v1/messages").json(&body).send().await?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }

        Ok(sse_response_stream(response, parse_sse_data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentBlock;

    #[test]
    fn test_build_params_minimal() {
        let request = ProviderRequest::new("claude-sonnet-4-20250514");
        let body = build_params(&request, false);
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["max_tokens"], 4096);
        assert!(body.get("stream").is_none());
        assert!(body.get("system").is_none());
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_build_params_full() {
        let mut request = ProviderRequest::new("claude-sonnet-4-20250514");
        request.system = Some("be terse".into());
        request.messages = vec![json!({"role": "user", "content": "hi"})];
        request.tools = vec![json!({"name": "echo"})];
        request.temperature = Some(0.3);
        request.top_k = Some(16);
        let body = build_params(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["tools"][0]["name"], "echo");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["top_k"], 16);
    }

    #[test]
    fn test_parse_message_with_tool_use() {
        let body = json!({
            "id": "msg_abc",
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "let me check"},
                {"type": "tool_use", "id": "tu_1", "name": "echo", "input": {"input": "hi"}}
            ],
            "usage": {
                "input_tokens": 20,
                "output_tokens": 9,
                "cache_read_input_tokens": 3
            }
        });
        let message = parse_message(&body);
        assert_eq!(message.message_id.as_deref(), Some("msg_abc"));
        assert_eq!(message.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(message.content.len(), 2);
        assert!(matches!(message.content[1], ContentBlock::ToolUse { .. }));
        assert_eq!(message.usage.input_tokens, 20);
        assert_eq!(message.usage.cache_read_tokens, 3);
    }

    #[test]
    fn test_parse_sse_message_start() {
        let data = r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":7,"output_tokens":0}}}"#;
        let events = parse_sse_data(data);
        assert_eq!(events.len(), 1);
        match events[0].as_ref().unwrap() {
            StreamEvent::MessageStart { message_id, usage } => {
                assert_eq!(message_id, "msg_1");
                assert_eq!(usage.input_tokens, 7);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_sse_message_delta() {
        let data = r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":42}}"#;
        let events = parse_sse_data(data);
        match events[0].as_ref().unwrap() {
            StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => {
                assert_eq!(stop_reason.as_deref(), Some("tool_use"));
                assert_eq!(*output_tokens, 42);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_sse_error_event() {
        let data = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let events = parse_sse_data(data);
        assert!(events[0].is_err());
    }

    #[test]
    fn test_parse_sse_ignores_unknown_events() {
        let data = r#"{"type":"sparkline_delta"}"#;
        assert!(parse_sse_data(data).is_empty());
    }

    #[test]
    fn test_parse_batch_status_values() {
        assert_eq!(parse_batch_status("in_progress").unwrap(), BatchStatus::InProgress);
        assert_eq!(parse_batch_status("canceling").unwrap(), BatchStatus::Canceling);
        assert_eq!(parse_batch_status("ended").unwrap(), BatchStatus::Ended);
        assert!(parse_batch_status("archived").is_err());
    }
}
