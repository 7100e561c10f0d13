//! Conversation summariser

use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

use crate::agents::domain::{Message, Role};
use crate::agents::error::{AgentError, AgentResult};
use crate::agents::llm::{CompletionRequest, LlmProvider};

/// Produces a replacement summary from the previous one and a slice of turns
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, previous_summary: Option<&str>, delta: &[Message]) -> AgentResult<String>;
}

pub const SUMMARIZER_INSTRUCTION: &str = "\
You maintain the running summary of a conversation between an SRE operator and an \
inspection assistant. You receive the previous summary (possibly empty) and a batch \
of newer messages. Produce ONE replacement summary that merges both.

Use exactly these sections, omitting any that are empty:
## Facts
Systems, services, hosts, incidents, alerts, metrics and their observed values.
## Decisions
Actions taken or agreed (acknowledged or resolved incidents, silences, escalations).
## Preferences
How the operator wants answers: time ranges, formats, services of interest.
## Open questions
Anything unresolved or awaiting confirmation.
## Next steps
Planned follow-ups.

Rules:
- The newer messages may correct the previous summary; when they conflict, the newer messages win.
- Keep identifiers exact (incident ids, alert names, PromQL, index names).
- Drop small talk and tool plumbing; keep conclusions.
- Stay under 400 words. Output the summary only.";

/// Summariser backed by a model
pub struct LlmSummarizer {
    model: Arc<dyn LlmProvider>,
    max_output_tokens: u32,
}

impl LlmSummarizer {
    pub fn new(model: Arc<dyn LlmProvider>, max_output_tokens: u32) -> Self {
        Self {
            model,
            max_output_tokens,
        }
    }

    fn render_request(previous_summary: Option<&str>, delta: &[Message]) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "<previous_summary>");
        let _ = writeln!(text, "{}", previous_summary.unwrap_or(""));
        let _ = writeln!(text, "</previous_summary>\n");
        let _ = writeln!(text, "<new_messages>");
        for message in delta {
            match message.role {
                Role::Tool => {
                    let _ = writeln!(
                        text,
                        "[tool {}] {}",
                        message.author().unwrap_or("tool"),
                        truncate(&message.content, 2000)
                    );
                }
                _ => {
                    for call in message.calls() {
                        let _ = writeln!(text, "[{} called {}] {}", message.role, call.name, call.arguments);
                    }
                    if !message.content.is_empty() {
                        match message.author() {
                            Some(author) => {
                                let _ = writeln!(text, "[{} {}] {}", message.role, author, message.content);
                            }
                            None => {
                                let _ = writeln!(text, "[{}] {}", message.role, message.content);
                            }
                        }
                    }
                }
            }
        }
        let _ = writeln!(text, "</new_messages>");
        text
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut)
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, previous_summary: Option<&str>, delta: &[Message]) -> AgentResult<String> {
        let request = CompletionRequest::new(vec![
            Message::system(SUMMARIZER_INSTRUCTION),
            Message::user(Self::render_request(previous_summary, delta)),
        ])
        .with_max_tokens(self.max_output_tokens);

        debug!(messages = delta.len(), has_previous = previous_summary.is_some(), "Summarising conversation");
        let response = self.model.complete(request).await?;
        let summary = response.message.content.trim().to_string();
        if summary.is_empty() {
            return Err(AgentError::Session("summariser returned an empty summary".to_string()));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::domain::ToolCall;
    use crate::agents::llm::{ScriptedProvider, ScriptedTurn};

    #[tokio::test]
    async fn test_request_carries_previous_summary_and_delta() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::text("  S2  ")]));
        let summarizer = LlmSummarizer::new(provider.clone(), 768);

        let delta = vec![
            Message::user("check api latency"),
            Message::assistant_with_tools(
                "",
                vec![ToolCall::new("c1", "prometheus", r#"{"operation":"query_instant"}"#)],
            )
            .with_author("service_agent"),
            Message::tool_result("c1", "prometheus", r#"{"success":true}"#),
            Message::assistant("p99 is 120ms").with_author("service_agent"),
        ];
        let summary = summarizer.summarize(Some("S1"), &delta).await.unwrap();
        assert_eq!(summary, "S2");

        let requests = provider.requests();
        assert_eq!(requests[0].max_tokens, Some(768));
        assert_eq!(requests[0].messages[0].content, SUMMARIZER_INSTRUCTION);
        let body = &requests[0].messages[1].content;
        assert!(body.contains("<previous_summary>\nS1\n"));
        assert!(body.contains("[assistant service_agent] p99 is 120ms"));
        assert!(body.contains("[assistant called prometheus]"));
        assert!(body.contains("[tool prometheus]"));
    }

    #[tokio::test]
    async fn test_empty_summary_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::text("   ")]));
        let summarizer = LlmSummarizer::new(provider, 100);
        let err = summarizer.summarize(None, &[Message::user("x")]).await.unwrap_err();
        assert!(matches!(err, AgentError::Session(_)));
    }

    #[test]
    fn test_truncate_long_tool_output() {
        let long = "x".repeat(2100);
        assert_eq!(truncate(&long, 2000).chars().count(), 2001);
        assert_eq!(truncate("short", 2000), "short");
    }
}
