//! Message types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::ToolCall;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message (instructions to the LLM)
    System,
    /// User message
    User,
    /// Assistant (LLM) message
    Assistant,
    /// Tool result message
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Lifecycle status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    /// Partial output, superseded by a later completed message
    Streaming,
    #[default]
    Completed,
    Failed,
}

/// Token usage reported by the model for one generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens used in the prompt/input
    pub input_tokens: u32,
    /// Tokens generated in the response
    pub output_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
    /// Input tokens served from the provider's prompt cache
    #[serde(default)]
    pub cached_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            cached_tokens: 0,
        }
    }
}

/// A message in a conversation
///
/// Assistant messages carry zero or more tool calls emitted before the
/// terminal text in `content`. Tool messages carry the response payload in
/// `content` and the call they answer in `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Message content (text)
    pub content: String,
    /// Tool calls made by the assistant (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// ID of the tool call this message is responding to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Author: the agent name for assistant messages, the tool name for tool messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Control signals raised by tools (e.g. handoff)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub actions: HashMap<String, Value>,
}

impl Message {
    fn base(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
            status: MessageStatus::Completed,
            usage: None,
            actions: HashMap::new(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content.into())
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content.into())
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content.into())
    }

    /// Create an assistant message with tool calls
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut message = Self::base(Role::Assistant, content.into());
        if !tool_calls.is_empty() {
            message.tool_calls = Some(tool_calls);
        }
        message
    }

    /// Create a partial assistant message carrying one streamed text delta
    pub fn streaming(delta: impl Into<String>) -> Self {
        let mut message = Self::base(Role::Assistant, delta.into());
        message.status = MessageStatus::Streaming;
        message
    }

    /// Create a tool result message
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut message = Self::base(Role::Tool, content.into());
        message.tool_call_id = Some(tool_call_id.into());
        message.name = Some(tool_name.into());
        message
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.name = Some(author.into());
        self
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn author(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.status == MessageStatus::Completed
    }

    /// Completed assistant message with no pending tool calls
    pub fn is_final_answer(&self) -> bool {
        self.role == Role::Assistant && self.is_completed() && !self.has_tool_calls()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().map_or(false, |calls| !calls.is_empty())
    }

    /// Tool calls as a slice (empty when none)
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }

    pub fn action(&self, key: &str) -> Option<&Value> {
        self.actions.get(key)
    }

    /// Input tokens reported for the generation that produced this message
    pub fn input_tokens(&self) -> u32 {
        self.usage.map_or(0, |u| u.input_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_with_empty_tools_has_no_calls() {
        let message = Message::assistant_with_tools("done", Vec::new());
        assert!(message.tool_calls.is_none());
        assert!(message.is_final_answer());
    }

    #[test]
    fn test_streaming_is_not_final() {
        let message = Message::streaming("par").with_author("general_agent");
        assert_eq!(message.status, MessageStatus::Streaming);
        assert!(!message.is_final_answer());
        assert_eq!(message.author(), Some("general_agent"));
    }

    #[test]
    fn test_role_round_trips_through_strings() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("robot".parse::<Role>().is_err());
    }

    #[test]
    fn test_serialization_skips_empty_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("actions").is_none());
    }
}
