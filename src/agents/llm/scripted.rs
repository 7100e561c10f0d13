//! Scripted provider: replays canned completions and records every request
//!
//! Used for offline runs of the agent loop, routing and summarisation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, LlmStream, StreamChunk,
    ToolCallDelta,
};
use crate::agents::domain::{Message, TokenUsage, ToolCall};
use crate::agents::error::{LlmError, LlmResult};

/// One canned model generation
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub error: Option<String>,
}

impl ScriptedTurn {
    /// A terminal text answer
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: TokenUsage::new(10, 5),
            error: None,
        }
    }

    /// A single tool call with a generated id
    pub fn tool_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self::text("").and_call(name, arguments)
    }

    /// Add another tool call to this turn
    pub fn and_call(mut self, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        self.tool_calls
            .push(ToolCall::new(ToolCall::generate_id(), name, arguments));
        self
    }

    /// Handoff to a child agent through the routing tool
    pub fn handoff(agent_name: &str) -> Self {
        Self::tool_call(
            "handoff_to_agent",
            serde_json::json!({ "agentName": agent_name }).to_string(),
        )
    }

    /// A provider failure
    pub fn error(message: impl Into<String>) -> Self {
        let mut turn = Self::text("");
        turn.error = Some(message.into());
        turn
    }

    pub fn with_input_tokens(mut self, input_tokens: u32) -> Self {
        self.usage = TokenUsage::new(input_tokens, self.usage.output_tokens);
        self
    }

    fn into_response(self) -> LlmResult<CompletionResponse> {
        if let Some(message) = self.error {
            return Err(LlmError::Api { status: 500, message });
        }
        let finish_reason = if self.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        Ok(CompletionResponse {
            message: Message::assistant_with_tools(self.text, self.tool_calls).with_usage(Some(self.usage)),
            finish_reason,
            usage: Some(self.usage),
        })
    }
}

struct Script {
    turns: VecDeque<ScriptedTurn>,
    requests: Vec<CompletionRequest>,
}

/// Provider that answers from a queue of scripted turns
#[derive(Clone)]
pub struct ScriptedProvider {
    model: String,
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
    context_window: u32,
}

impl ScriptedProvider {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            model: "scripted".to_string(),
            script: Arc::new(Mutex::new(Script {
                turns: turns.into_iter().collect(),
                requests: Vec::new(),
            })),
            delay: None,
            context_window: 128000,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Wait this long before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    /// Queue more turns
    pub fn push(&self, turn: ScriptedTurn) {
        self.script.lock().turns.push_back(turn);
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.script.lock().requests.clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().turns.len()
    }

    fn next_turn(&self, request: CompletionRequest) -> LlmResult<ScriptedTurn> {
        let mut script = self.script.lock();
        script.requests.push(request);
        script
            .turns
            .pop_front()
            .ok_or_else(|| LlmError::InvalidRequest("scripted provider has no turns left".to_string()))
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<CompletionResponse> {
        let turn = self.next_turn(request)?;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        turn.into_response()
    }

    fn complete_stream(&self, request: CompletionRequest) -> LlmStream {
        let (sender, stream) = LlmStream::channel(16);
        let turn = self.next_turn(request);
        let delay = self.delay;

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let response = match turn.and_then(ScriptedTurn::into_response) {
                Ok(response) => response,
                Err(e) => {
                    let _ = sender.send_error(e).await;
                    return;
                }
            };

            // Split text at word boundaries so consumers see several deltas
            let text = response.message.content.clone();
            for piece in text.split_inclusive(' ') {
                if sender.send_text(piece).await.is_err() {
                    return;
                }
            }
            for (index, call) in response.message.calls().iter().enumerate() {
                if sender
                    .send(StreamChunk::tool_call(ToolCallDelta::complete(index, call)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = sender.send_finish(response.finish_reason, response.usage).await;
        });

        stream
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    fn max_output_tokens(&self) -> u32 {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_turns_in_order() {
        let provider = ScriptedProvider::new(vec![
            ScriptedTurn::tool_call("prometheus", r#"{"operation":"list_targets"}"#),
            ScriptedTurn::text("all targets up").with_input_tokens(77),
        ]);

        let first = provider
            .complete_stream(CompletionRequest::new(vec![Message::user("q")]))
            .collect()
            .await
            .unwrap();
        assert_eq!(first.finish_reason, FinishReason::ToolCalls);
        assert_eq!(first.message.calls()[0].name, "prometheus");

        let second = provider
            .complete_stream(CompletionRequest::new(vec![Message::user("q2")]))
            .collect()
            .await
            .unwrap();
        assert_eq!(second.message.content, "all targets up");
        assert_eq!(second.message.input_tokens(), 77);

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages[0].content, "q2");
    }

    #[tokio::test]
    async fn test_exhausted_script_errors() {
        let provider = ScriptedProvider::new(Vec::new());
        let err = provider
            .complete(CompletionRequest::new(vec![Message::user("q")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_error_turn_fails_stream() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::error("upstream overloaded")]);
        let err = provider
            .complete_stream(CompletionRequest::default())
            .collect()
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Api { status: 500, .. }));
    }
}
