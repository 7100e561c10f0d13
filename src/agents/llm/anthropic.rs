//! Anthropic LLM Provider with streaming support

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    drain_lines, http_client, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
    LlmStream, LlmStreamSender, StreamChunk, ToolCallDelta, ToolChoice,
};
use crate::agents::config::LlmProviderConfig;
use crate::agents::domain::{Message, Role, TokenUsage, ToolCall};
use crate::agents::error::{LlmError, LlmResult};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic LLM Provider
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    default_temperature: f32,
    default_max_tokens: u32,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider from configuration
    pub fn new(config: &LlmProviderConfig) -> LlmResult<Self> {
        if config.model.trim().is_empty() {
            return Err(LlmError::InvalidRequest("anthropic: model is required".to_string()));
        }
        let api_key = config.resolve_api_key().ok_or_else(|| {
            LlmError::Authentication("ANTHROPIC_API_KEY environment variable not set".to_string())
        })?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            client: http_client(config)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            default_temperature: config.temperature_or_default(),
            default_max_tokens: config.max_tokens_or_default(),
        })
    }

    /// Build the request body for Anthropic API
    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        let (system_prompt, messages) = convert_messages(&request.wire_messages());

        let mut body = json!({
            "model": request.model.as_ref().unwrap_or(&self.model),
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.default_max_tokens),
            "temperature": request.temperature.unwrap_or(self.default_temperature),
        });

        if let Some(system) = system_prompt {
            body["system"] = json!(system);
        }

        if let Some(stop) = &request.stop {
            body["stop_sequences"] = json!(stop);
        }

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                body["tools"] = json!(tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters
                    }))
                    .collect::<Vec<_>>());
            }
        }

        if let Some(tool_choice) = &request.tool_choice {
            body["tool_choice"] = match tool_choice {
                ToolChoice::Auto => json!({ "type": "auto" }),
                ToolChoice::None => json!({ "type": "none" }),
                ToolChoice::Required => json!({ "type": "any" }),
                ToolChoice::Tool { name } => json!({ "type": "tool", "name": name }),
            };
        }

        if request.stream {
            body["stream"] = json!(true);
        }

        body
    }

    fn parse_response(response: AnthropicResponse) -> CompletionResponse {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for block in response.content {
            match block.block_type.as_str() {
                "text" => {
                    if let Some(text) = &block.text {
                        content.push_str(text);
                    }
                }
                "tool_use" => {
                    if let (Some(id), Some(name)) = (block.id, block.name) {
                        let input = block.input.unwrap_or_else(|| json!({}));
                        tool_calls.push(ToolCall::new(id, name, input.to_string()));
                    }
                }
                _ => {}
            }
        }

        let usage = Some(response.usage.into_usage());
        CompletionResponse {
            message: Message::assistant_with_tools(content, tool_calls).with_usage(usage),
            finish_reason: stop_reason(response.stop_reason.as_deref()),
            usage,
        }
    }

    async fn stream_completion(
        client: reqwest::Client,
        api_key: SecretString,
        base_url: String,
        body: Value,
        sender: LlmStreamSender,
    ) -> LlmResult<()> {
        let response = client
            .post(format!("{}/v1/messages", base_url))
            .header("x-api-key", api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), error_text));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut state = StreamState::default();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Streaming(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            for line in drain_lines(&mut buffer) {
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<AnthropicStreamEvent>(data) else {
                    continue;
                };
                if event.event_type == "message_stop" {
                    return Ok(());
                }
                if event.event_type == "error" {
                    return Err(LlmError::Streaming(data.to_string()));
                }
                if let Some(chunk) = state.apply(event) {
                    if sender.send(chunk).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

/// Tracks tool-use block indices and input tokens across SSE events
#[derive(Default)]
struct StreamState {
    tool_call_index: usize,
    input_tokens: u32,
}

impl StreamState {
    fn apply(&mut self, event: AnthropicStreamEvent) -> Option<StreamChunk> {
        match event.event_type.as_str() {
            "message_start" => {
                if let Some(usage) = event.message.and_then(|m| m.usage) {
                    self.input_tokens = usage.input_tokens.unwrap_or(0);
                }
                None
            }
            "content_block_start" => {
                let block = event.content_block?;
                if block.block_type != "tool_use" {
                    return None;
                }
                let delta = ToolCallDelta::new(self.tool_call_index)
                    .with_id(block.id.unwrap_or_default())
                    .with_name(block.name.unwrap_or_default());
                self.tool_call_index += 1;
                Some(StreamChunk::tool_call(delta))
            }
            "content_block_delta" => {
                let delta = event.delta?;
                match delta.delta_type.as_str() {
                    "text_delta" => delta.text.map(StreamChunk::text),
                    "input_json_delta" => delta.partial_json.map(|partial| {
                        StreamChunk::tool_call(
                            ToolCallDelta::new(self.tool_call_index.saturating_sub(1)).with_arguments(partial),
                        )
                    }),
                    _ => None,
                }
            }
            "message_delta" => {
                let reason = event.delta?.stop_reason?;
                let output = event.usage.and_then(|u| u.output_tokens).unwrap_or(0);
                Some(StreamChunk::finish(
                    stop_reason(Some(&reason)),
                    Some(TokenUsage::new(self.input_tokens, output)),
                ))
            }
            _ => None,
        }
    }
}

fn stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn api_error(status: u16, message: String) -> LlmError {
    match status {
        401 | 403 => LlmError::Authentication(message),
        429 => LlmError::RateLimited { retry_after_ms: None },
        _ => LlmError::Api { status, message },
    }
}

/// Convert internal messages to Anthropic format
///
/// Returns (system_prompt, messages). Multiple system messages are joined,
/// since Anthropic takes a single top-level system field.
fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut converted = Vec::new();

    for m in messages {
        match m.role {
            Role::System => system_parts.push(&m.content),
            Role::User => converted.push(json!({ "role": "user", "content": m.content })),
            Role::Assistant if m.has_tool_calls() => {
                let mut content = Vec::new();
                if !m.content.is_empty() {
                    content.push(json!({ "type": "text", "text": m.content }));
                }
                for tc in m.calls() {
                    content.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments_value()
                    }));
                }
                converted.push(json!({ "role": "assistant", "content": content }));
            }
            Role::Assistant => {
                converted.push(json!({ "role": "assistant", "content": m.content }));
            }
            Role::Tool => {
                // Anthropic expects tool results in user messages
                converted.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                        "content": m.content
                    }]
                }));
            }
        }
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    (system, converted)
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<CompletionResponse> {
        let mut req = request;
        req.stream = false;
        let body = self.build_request_body(&req);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), error_text));
        }

        let anthropic_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("Failed to parse response: {}", e)))?;

        Ok(Self::parse_response(anthropic_response))
    }

    fn complete_stream(&self, request: CompletionRequest) -> LlmStream {
        let (sender, stream) = LlmStream::channel(64);

        let client = self.client.clone();
        let api_key = SecretString::from(self.api_key.expose_secret().to_string());
        let base_url = self.base_url.clone();
        let mut req = request;
        req.stream = true;
        let body = self.build_request_body(&req);

        tokio::spawn(async move {
            let result = Self::stream_completion(client, api_key, base_url, body, sender.clone()).await;
            if let Err(e) = result {
                let _ = sender.send_error(e).await;
            }
        });

        stream
    }

    fn context_window(&self) -> u32 {
        200000
    }

    fn max_output_tokens(&self) -> u32 {
        match self.model.as_str() {
            m if m.contains("claude-3-5") || m.contains("sonnet-4") => 8192,
            _ => 4096,
        }
    }
}

// Anthropic API response types

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
}

impl AnthropicUsage {
    fn into_usage(self) -> TokenUsage {
        let mut usage = TokenUsage::new(self.input_tokens, self.output_tokens);
        usage.cached_tokens = self.cache_read_input_tokens.unwrap_or(0);
        usage
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    message: Option<StreamMessage>,
    content_block: Option<StreamContentBlock>,
    delta: Option<StreamDelta>,
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type", default)]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::config::LlmProviderType;

    fn event(data: &str) -> AnthropicStreamEvent {
        serde_json::from_str(data).unwrap()
    }

    #[test]
    fn test_system_messages_are_lifted() {
        let messages = vec![
            Message::system("instruction"),
            Message::system("summary"),
            Message::user("hi"),
        ];
        let (system, converted) = convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("instruction\n\nsummary"));
        assert_eq!(converted.len(), 1);
    }

    #[test]
    fn test_tool_use_input_is_structured() {
        let messages = vec![Message::assistant_with_tools(
            "",
            vec![ToolCall::new("t1", "pagerduty", r#"{"operation":"list_incidents"}"#)],
        )];
        let (_, converted) = convert_messages(&messages);
        assert_eq!(converted[0]["content"][0]["input"]["operation"], "list_incidents");
    }

    #[test]
    fn test_stream_state_tracks_usage_and_tools() {
        let mut state = StreamState::default();
        assert!(state
            .apply(event(r#"{"type":"message_start","message":{"usage":{"input_tokens":42,"output_tokens":1}}}"#))
            .is_none());

        let chunk = state
            .apply(event(r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"prometheus"}}"#))
            .unwrap();
        assert_eq!(chunk.tool_calls[0].index, 0);

        let chunk = state
            .apply(event(r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}"#))
            .unwrap();
        assert_eq!(chunk.tool_calls[0].arguments.as_deref(), Some("{\"a\""));

        let chunk = state
            .apply(event(r#"{"type":"message_delta","delta":{"stop_reason":"tool_use","stop_sequence":null},"usage":{"output_tokens":7}}"#))
            .unwrap();
        assert_eq!(chunk.finish_reason, Some(FinishReason::ToolCalls));
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.input_tokens, 42);
        assert_eq!(usage.output_tokens, 7);
    }

    #[test]
    fn test_parse_response_serialises_input() {
        let response: AnthropicResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"checking"},{"type":"tool_use","id":"toolu_1","name":"prometheus","input":{"operation":"list_targets"}}],"stop_reason":"tool_use","usage":{"input_tokens":10,"output_tokens":4}}"#,
        )
        .unwrap();
        let parsed = AnthropicProvider::parse_response(response);
        assert_eq!(parsed.finish_reason, FinishReason::ToolCalls);
        assert_eq!(parsed.message.calls()[0].arguments_value()["operation"], "list_targets");
        assert_eq!(parsed.message.input_tokens(), 10);
    }

    #[test]
    fn test_toolless_request_body_has_no_tool_blocks() {
        let config = LlmProviderConfig::new(LlmProviderType::Anthropic, "claude-3-5-sonnet-latest")
            .with_api_key("sk-ant-test");
        let provider = AnthropicProvider::new(&config).unwrap();
        let request = CompletionRequest::new(vec![
            Message::system("You write inspection reports."),
            Message::user("inspect web"),
            Message::assistant_with_tools(
                "",
                vec![ToolCall::new("toolu_1", "handoff_to_agent", r#"{"agentName":"analysis"}"#)],
            ),
            Message::tool_result("toolu_1", "handoff_to_agent", r#"{"success":true}"#),
            Message::assistant("cpu at 93%").with_author("service_agent"),
        ]);

        let body = provider.build_request_body(&request);
        assert!(body.get("tools").is_none());
        let text = body["messages"].to_string();
        assert!(!text.contains("tool_use"));
        assert!(!text.contains("tool_result"));
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert!(body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .contains("handoff_to_agent"));
        assert_eq!(body["messages"][2]["role"], "user");
    }
}
