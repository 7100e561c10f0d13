//! Google Gemini LLM Provider with streaming support

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    drain_lines, http_client, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
    LlmStream, LlmStreamSender, StreamChunk, ToolCallDelta, ToolChoice,
};
use crate::agents::config::LlmProviderConfig;
use crate::agents::domain::{Message, Role, TokenUsage, ToolCall};
use crate::agents::error::{LlmError, LlmResult};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini LLM Provider
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    default_temperature: f32,
    default_max_tokens: u32,
}

impl GeminiProvider {
    /// Create a new Gemini provider from configuration
    pub fn new(config: &LlmProviderConfig) -> LlmResult<Self> {
        if config.model.trim().is_empty() {
            return Err(LlmError::InvalidRequest("gemini: model is required".to_string()));
        }
        let api_key = config.resolve_api_key().ok_or_else(|| {
            LlmError::Authentication(
                "GEMINI_API_KEY or GOOGLE_API_KEY environment variable not set".to_string(),
            )
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

    /// Build the request body for Gemini API
    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        let (system, contents) = convert_messages(&request.wire_messages());
        let mut body = json!({ "contents": contents });

        if let Some(system) = system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        let mut generation_config = json!({
            "temperature": request.temperature.unwrap_or(self.default_temperature),
            "maxOutputTokens": request.max_tokens.unwrap_or(self.default_max_tokens),
        });
        if let Some(stop) = &request.stop {
            generation_config["stopSequences"] = json!(stop);
        }
        body["generationConfig"] = generation_config;

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                body["tools"] = json!([{
                    "function_declarations": tools.iter().map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": gemini_schema(&t.parameters)
                    })).collect::<Vec<_>>()
                }]);
            }
        }

        if let Some(tool_choice) = &request.tool_choice {
            body["tool_config"] = match tool_choice {
                ToolChoice::Auto => json!({ "function_calling_config": { "mode": "AUTO" } }),
                ToolChoice::None => json!({ "function_calling_config": { "mode": "NONE" } }),
                ToolChoice::Required => json!({ "function_calling_config": { "mode": "ANY" } }),
                ToolChoice::Tool { name } => json!({
                    "function_calling_config": {
                        "mode": "ANY",
                        "allowed_function_names": [name]
                    }
                }),
            };
        }

        body
    }

    fn parse_response(response: GeminiResponse) -> LlmResult<CompletionResponse> {
        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Parse("No candidates in response".to_string()))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for part in candidate.content.and_then(|c| c.parts).unwrap_or_default() {
            if let Some(text) = &part.text {
                content.push_str(text);
            }
            if let Some(fc) = part.function_call {
                let args = fc.args.unwrap_or_else(|| json!({}));
                tool_calls.push(ToolCall::new(ToolCall::generate_id(), fc.name, args.to_string()));
            }
        }

        let usage = response.usage_metadata.map(GeminiUsageMetadata::into_usage);
        Ok(CompletionResponse {
            message: Message::assistant_with_tools(content, tool_calls).with_usage(usage),
            finish_reason: finish_reason(candidate.finish_reason.as_deref()),
            usage,
        })
    }

    async fn stream_completion(
        client: reqwest::Client,
        api_key: SecretString,
        url: String,
        body: Value,
        sender: LlmStreamSender,
    ) -> LlmResult<()> {
        let response = client
            .post(&url)
            .header("x-goog-api-key", api_key.expose_secret())
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
        let mut tool_call_index = 0usize;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Streaming(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            for line in drain_lines(&mut buffer) {
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                let Ok(parsed) = serde_json::from_str::<GeminiResponse>(data) else {
                    continue;
                };
                let chunk = stream_chunk(parsed, &mut tool_call_index);
                if chunk.has_content() || !chunk.tool_calls.is_empty() || chunk.is_final() || chunk.usage.is_some() {
                    if sender.send(chunk).await.is_err() {
                        return Ok(()); // Receiver dropped
                    }
                }
            }
        }

        Ok(())
    }
}

fn stream_chunk(parsed: GeminiResponse, tool_call_index: &mut usize) -> StreamChunk {
    let mut chunk = StreamChunk {
        usage: parsed.usage_metadata.map(GeminiUsageMetadata::into_usage),
        ..Default::default()
    };

    if let Some(candidate) = parsed.candidates.into_iter().next() {
        for part in candidate.content.and_then(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                chunk.content.push_str(&text);
            }
            // Gemini sends each function call whole
            if let Some(fc) = part.function_call {
                let call = ToolCall::new(
                    ToolCall::generate_id(),
                    fc.name,
                    fc.args.unwrap_or_else(|| json!({})).to_string(),
                );
                chunk.tool_calls.push(ToolCallDelta::complete(*tool_call_index, &call));
                *tool_call_index += 1;
            }
        }
        chunk.finish_reason = candidate.finish_reason.as_deref().map(|r| finish_reason(Some(r)));
    }

    chunk
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") | Some("PROHIBITED_CONTENT") => FinishReason::ContentFilter,
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

/// Strip JSON Schema keywords Gemini's function declarations reject
///
/// Nullable unions (`"type": ["string", "null"]`) become `nullable: true`.
fn gemini_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => {
            let mut out = Map::new();
            for (key, value) in obj {
                match key.as_str() {
                    "$schema" | "title" | "additionalProperties" | "definitions" | "default" => {}
                    "type" => match value {
                        Value::Array(types) => {
                            let concrete: Vec<&Value> = types.iter().filter(|t| t.as_str() != Some("null")).collect();
                            if let Some(first) = concrete.first() {
                                out.insert("type".to_string(), (*first).clone());
                            }
                            if concrete.len() != types.len() {
                                out.insert("nullable".to_string(), Value::Bool(true));
                            }
                        }
                        other => {
                            out.insert(key.clone(), other.clone());
                        }
                    },
                    _ => {
                        out.insert(key.clone(), gemini_schema(value));
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(gemini_schema).collect()),
        other => other.clone(),
    }
}

/// Convert internal messages to Gemini format
///
/// Returns (system_instruction, contents).
fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut contents = Vec::new();

    for m in messages {
        match m.role {
            Role::System => system_parts.push(&m.content),
            Role::User => {
                contents.push(json!({ "role": "user", "parts": [{ "text": m.content }] }));
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                if !m.content.is_empty() {
                    parts.push(json!({ "text": m.content }));
                }
                for tc in m.calls() {
                    parts.push(json!({
                        "functionCall": { "name": tc.name, "args": tc.arguments_value() }
                    }));
                }
                if !parts.is_empty() {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
            Role::Tool => {
                let tool_name = m.name.clone().unwrap_or_else(|| "tool".to_string());
                let response_value = match serde_json::from_str::<Value>(&m.content) {
                    Ok(Value::Object(obj)) => Value::Object(obj),
                    _ => json!({ "result": m.content }),
                };
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": { "name": tool_name, "response": response_value }
                    }]
                }));
            }
        }
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    (system, contents)
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<CompletionResponse> {
        let body = self.build_request_body(&request);
        let model = request.model.as_ref().unwrap_or(&self.model);
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), error_text));
        }

        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("Failed to parse response: {}", e)))?;

        Self::parse_response(gemini_response)
    }

    fn complete_stream(&self, request: CompletionRequest) -> LlmStream {
        let (sender, stream) = LlmStream::channel(64);

        let client = self.client.clone();
        let api_key = SecretString::from(self.api_key.expose_secret().to_string());
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        let url = format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url, model);
        let body = self.build_request_body(&request);

        tokio::spawn(async move {
            let result = Self::stream_completion(client, api_key, url, body, sender.clone()).await;
            if let Err(e) = result {
                let _ = sender.send_error(e).await;
            }
        });

        stream
    }

    fn context_window(&self) -> u32 {
        match self.model.as_str() {
            m if m.contains("gemini-1.5-pro") => 2_097_152,
            m if m.contains("gemini-1.5") || m.contains("gemini-2") => 1_048_576,
            _ => 32768,
        }
    }

    fn max_output_tokens(&self) -> u32 {
        match self.model.as_str() {
            m if m.contains("gemini-2.5") => 65536,
            _ => 8192,
        }
    }
}

// Gemini API response types (shared by the unary and SSE endpoints)

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    text: Option<String>,
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFunctionCall {
    name: String,
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    cached_content_token_count: Option<u32>,
}

impl GeminiUsageMetadata {
    fn into_usage(self) -> TokenUsage {
        let mut usage = TokenUsage::new(
            self.prompt_token_count.unwrap_or(0),
            self.candidates_token_count.unwrap_or(0),
        );
        usage.cached_tokens = self.cached_content_token_count.unwrap_or(0);
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_sanitised() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "PagerDutyRequest",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "operation": { "type": "string", "enum": ["list_incidents"] },
                "list_incidents": { "type": ["object", "null"], "properties": {} }
            }
        });
        let cleaned = gemini_schema(&schema);
        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned.get("title").is_none());
        assert_eq!(cleaned["properties"]["list_incidents"]["type"], "object");
        assert_eq!(cleaned["properties"]["list_incidents"]["nullable"], true);
        assert_eq!(cleaned["properties"]["operation"]["enum"][0], "list_incidents");
    }

    #[test]
    fn test_tool_result_becomes_function_response() {
        let messages = vec![
            Message::system("be terse"),
            Message::user("targets?"),
            Message::tool_result("c1", "prometheus", r#"{"success":true}"#),
            Message::tool_result("c2", "prometheus", "plain text"),
        ];
        let (system, contents) = convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("be terse"));
        assert_eq!(contents[1]["parts"][0]["functionResponse"]["name"], "prometheus");
        assert_eq!(contents[1]["parts"][0]["functionResponse"]["response"]["success"], true);
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["response"]["result"], "plain text");
    }

    #[test]
    fn test_stream_chunk_carries_whole_calls() {
        let parsed: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"handoff_to_agent","args":{"agentName":"report_agent"}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":33,"candidatesTokenCount":2}}"#,
        )
        .unwrap();
        let mut index = 0;
        let chunk = stream_chunk(parsed, &mut index);
        assert_eq!(index, 1);
        assert_eq!(chunk.tool_calls[0].name.as_deref(), Some("handoff_to_agent"));
        assert_eq!(chunk.finish_reason, Some(FinishReason::Stop));
        assert_eq!(chunk.usage.unwrap().input_tokens, 33);
    }
}
