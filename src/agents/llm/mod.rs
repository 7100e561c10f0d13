//! LLM Provider implementations with streaming support
//!
//! This module provides a unified interface for interacting with various LLM providers:
//! - OpenAI (GPT-4o and compatible endpoints)
//! - Anthropic (Claude)
//! - Google Gemini
//!
//! plus a scripted provider for offline runs and the model registry that
//! binds agent names to constructed providers.

mod anthropic;
mod gemini;
mod openai;
mod registry;
mod scripted;
mod stream;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use registry::ModelRegistry;
pub use scripted::{ScriptedProvider, ScriptedTurn};
pub use stream::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use crate::agents::config::{LlmProviderConfig, LlmProviderType};
use crate::agents::domain::{Message, Role, TokenUsage, ToolDefinition};
use crate::agents::error::{LlmError, LlmResult};

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Get the model being used
    fn model(&self) -> &str;

    /// Complete a request (non-streaming)
    async fn complete(&self, request: CompletionRequest) -> LlmResult<CompletionResponse>;

    /// Complete a request with streaming
    fn complete_stream(&self, request: CompletionRequest) -> LlmStream;

    /// Approximate token count for a text string
    fn count_tokens(&self, text: &str) -> u32 {
        (text.len() / 4) as u32
    }

    /// Get the context window size for the model
    fn context_window(&self) -> u32;

    /// Get the maximum output tokens for the model
    fn max_output_tokens(&self) -> u32;

    /// Release provider resources
    async fn close(&self) -> LlmResult<()> {
        Ok(())
    }
}

/// Request for LLM completion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Messages in the conversation
    pub messages: Vec<Message>,
    /// Model to use (overrides provider default)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Temperature for sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Tools available for calling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Tool choice mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        if !tools.is_empty() {
            self.tools = Some(tools);
            self.tool_choice = Some(ToolChoice::Auto);
        }
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn declares_tools(&self) -> bool {
        self.tools.as_ref().map_or(false, |tools| !tools.is_empty())
    }

    /// Messages to send upstream
    ///
    /// A request without tool definitions cannot carry tool-use blocks on
    /// Anthropic or Gemini, so earlier tool traffic is rendered as text.
    pub(crate) fn wire_messages(&self) -> Cow<'_, [Message]> {
        if self.declares_tools() {
            Cow::Borrowed(&self.messages)
        } else {
            Cow::Owned(flatten_tool_history(&self.messages))
        }
    }
}

/// Rewrite tool calls and tool results as plain assistant and user text
pub(crate) fn flatten_tool_history(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Assistant if m.has_tool_calls() => {
                let mut lines: Vec<String> = Vec::new();
                if !m.content.is_empty() {
                    lines.push(m.content.clone());
                }
                for call in m.calls() {
                    lines.push(format!("[called {} with {}]", call.name, call.arguments));
                }
                let mut flat = m.clone();
                flat.tool_calls = None;
                flat.content = lines.join("\n");
                flat
            }
            Role::Tool => {
                let tool = m.name.as_deref().unwrap_or("tool");
                let mut flat = Message::user(format!("[{} returned] {}", tool, m.content));
                flat.status = m.status;
                flat
            }
            _ => m.clone(),
        })
        .collect()
}

/// Tool choice mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Let the model decide
    Auto,
    /// Don't use tools
    None,
    /// Must use a tool
    Required,
    /// Use a specific tool
    Tool { name: String },
}

/// Response from LLM completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated message
    pub message: Message,
    /// Reason the completion stopped
    pub finish_reason: FinishReason,
    /// Token usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Reason completion stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop
    Stop,
    /// Hit max tokens
    Length,
    /// Tool call requested
    ToolCalls,
    /// Content filtered
    ContentFilter,
}

impl FinishReason {
    /// Map an OpenAI-style finish reason string
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

/// Build the shared HTTP client for a provider, honouring the per-agent timeout
pub(crate) fn http_client(config: &LlmProviderConfig) -> LlmResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs()))
        .build()
        .map_err(|e| LlmError::InvalidRequest(format!("failed to build HTTP client: {}", e)))
}

/// Create an LLM provider from configuration
pub fn create_provider(config: &LlmProviderConfig) -> LlmResult<Arc<dyn LlmProvider>> {
    match config.provider {
        LlmProviderType::OpenAI => {
            let provider = OpenAiProvider::new(config)?;
            Ok(Arc::new(provider))
        }
        LlmProviderType::Anthropic => {
            let provider = AnthropicProvider::new(config)?;
            Ok(Arc::new(provider))
        }
        LlmProviderType::Gemini => {
            let provider = GeminiProvider::new(config)?;
            Ok(Arc::new(provider))
        }
    }
}
