//! OpenAI LLM Provider with streaming support

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
use crate::agents::domain::{Message, TokenUsage, ToolCall, ToolDefinition};
use crate::agents::error::{LlmError, LlmResult};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI LLM Provider
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    default_temperature: f32,
    default_max_tokens: u32,
}

impl OpenAiProvider {
    /// Create a new OpenAI provider from configuration
    pub fn new(config: &LlmProviderConfig) -> LlmResult<Self> {
        if config.model.trim().is_empty() {
            return Err(LlmError::InvalidRequest("openai: model is required".to_string()));
        }
        let api_key = config.resolve_api_key().ok_or_else(|| {
            LlmError::Authentication("OPENAI_API_KEY environment variable not set".to_string())
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

    /// Build the request body for OpenAI API
    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": request.model.as_ref().unwrap_or(&self.model),
            "messages": convert_messages(&request.messages),
            "temperature": request.temperature.unwrap_or(self.default_temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.default_max_tokens),
        });

        if let Some(stop) = &request.stop {
            body["stop"] = json!(stop);
        }

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                body["tools"] = json!(tools.iter().map(convert_tool).collect::<Vec<_>>());
            }
        }

        if let Some(tool_choice) = &request.tool_choice {
            body["tool_choice"] = match tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
                ToolChoice::Required => json!("required"),
                ToolChoice::Tool { name } => json!({
                    "type": "function",
                    "function": { "name": name }
                }),
            };
        }

        if request.stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }

        body
    }

    /// Parse a non-streaming response
    fn parse_response(response: OpenAiResponse) -> LlmResult<CompletionResponse> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Parse("No choices in response".to_string()))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
            .collect();

        let usage = response.usage.map(OpenAiUsage::into_usage);
        let message = Message::assistant_with_tools(choice.message.content.unwrap_or_default(), tool_calls)
            .with_usage(usage);

        Ok(CompletionResponse {
            message,
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map_or(FinishReason::Stop, FinishReason::from_openai),
            usage,
        })
    }

    async fn stream_completion(
        client: reqwest::Client,
        api_key: SecretString,
        base_url: String,
        body: Value,
        sender: LlmStreamSender,
    ) -> LlmResult<()> {
        let response = client
            .post(format!("{}/chat/completions", base_url))
            .bearer_auth(api_key.expose_secret())
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

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Streaming(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            for line in drain_lines(&mut buffer) {
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(());
                }

                let Ok(parsed) = serde_json::from_str::<OpenAiStreamResponse>(data) else {
                    continue;
                };
                if sender.send(stream_chunk(parsed)).await.is_err() {
                    return Ok(()); // Receiver dropped
                }
            }
        }

        Ok(())
    }
}

fn api_error(status: u16, message: String) -> LlmError {
    match status {
        401 | 403 => LlmError::Authentication(message),
        429 => LlmError::RateLimited { retry_after_ms: None },
        _ => LlmError::Api { status, message },
    }
}

/// Convert internal messages to OpenAI format
fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = json!({
                "role": m.role.to_string(),
                "content": m.content,
            });

            if m.has_tool_calls() {
                msg["tool_calls"] = json!(m
                    .calls()
                    .iter()
                    .map(|tc| json!({
                        "id": tc.id,
                        "type": "function",
                        "function": { "name": tc.name, "arguments": tc.arguments }
                    }))
                    .collect::<Vec<_>>());
            }

            if let Some(tool_call_id) = &m.tool_call_id {
                msg["tool_call_id"] = json!(tool_call_id);
            }

            msg
        })
        .collect()
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    // OpenAI requires at minimum {"type": "object"} for function parameters
    let params = match tool.parameters.as_object() {
        Some(obj) if !obj.is_empty() => {
            let mut p = tool.parameters.clone();
            if p.get("type").is_none() {
                p["type"] = json!("object");
            }
            p
        }
        _ => json!({ "type": "object", "properties": {}, "required": [] }),
    };
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": params
        }
    })
}

fn stream_chunk(parsed: OpenAiStreamResponse) -> StreamChunk {
    let mut chunk = StreamChunk {
        usage: parsed.usage.map(OpenAiUsage::into_usage),
        ..Default::default()
    };

    if let Some(choice) = parsed.choices.into_iter().next() {
        chunk.content = choice.delta.content.unwrap_or_default();

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let mut delta = ToolCallDelta::new(tc.index);
            delta.id = tc.id;
            if let Some(func) = tc.function {
                delta.name = func.name;
                delta.arguments = func.arguments;
            }
            chunk.tool_calls.push(delta);
        }

        chunk.finish_reason = choice.finish_reason.as_deref().map(FinishReason::from_openai);
    }

    chunk
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), error_text));
        }

        let openai_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("Failed to parse response: {}", e)))?;

        Self::parse_response(openai_response)
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
        match self.model.as_str() {
            m if m.contains("gpt-4.1") => 1_047_576,
            m if m.contains("gpt-4-turbo") || m.contains("gpt-4o") => 128000,
            m if m.contains("gpt-4") => 8192,
            m if m.contains("gpt-3.5-turbo") => 16384,
            _ => 128000,
        }
    }

    fn max_output_tokens(&self) -> u32 {
        match self.model.as_str() {
            m if m.contains("gpt-4o") => 16384,
            _ => 4096,
        }
    }
}

// OpenAI API response types

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<OpenAiPromptDetails>,
}

#[derive(Debug, Deserialize)]
struct OpenAiPromptDetails {
    #[serde(default)]
    cached_tokens: u32,
}

impl OpenAiUsage {
    fn into_usage(self) -> TokenUsage {
        let mut usage = TokenUsage::new(self.prompt_tokens, self.completion_tokens);
        usage.cached_tokens = self.prompt_tokens_details.map_or(0, |d| d.cached_tokens);
        usage
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}
