//! Session documents
//!
//! A saved session is a readable transcript followed by a JSON dump between
//! `BEGIN_SESSION_JSON` and `END_SESSION_JSON`. Only the dump is read back.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use super::Session;
use crate::agents::domain::{Message, Role};
use crate::agents::error::{AgentError, AgentResult};

/// First line of every session document
pub const SESSION_HEADER: &str = "# patrol session transcript";
pub const BEGIN_MARKER: &str = "BEGIN_SESSION_JSON";
pub const END_MARKER: &str = "END_SESSION_JSON";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub text: String,
}

impl From<PersistedMessage> for Message {
    fn from(persisted: PersistedMessage) -> Self {
        let message = match persisted.role {
            Role::User => Message::user(persisted.text),
            _ => Message::assistant(persisted.text),
        };
        match persisted.author {
            Some(author) => message.with_author(author),
            None => message,
        }
    }
}

/// The JSON dump embedded in a session document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub session_id: String,
    #[serde(default)]
    pub state: HashMap<String, Value>,
    #[serde(default)]
    pub messages: Vec<PersistedMessage>,
}

impl SessionDocument {
    /// Snapshot a session
    ///
    /// Only completed user and assistant messages with text are kept; an
    /// assistant turn that only called tools has nothing to restore.
    pub fn from_session(session: &dyn Session) -> Self {
        let messages = session
            .history()
            .into_iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant) && m.is_completed())
            .filter(|m| !(m.has_tool_calls() && m.content.is_empty()))
            .map(|m| PersistedMessage {
                role: m.role,
                author: m.name.clone(),
                text: m.content,
            })
            .collect();

        Self {
            session_id: session.id().to_string(),
            state: session.state(),
            messages,
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages.into_iter().map(Message::from).collect()
    }

    /// Render the full document: transcript then JSON dump
    pub fn render(&self) -> AgentResult<String> {
        let mut out = String::new();
        let _ = writeln!(out, "{}", SESSION_HEADER);
        let _ = writeln!(out, "session: {}", self.session_id);
        let _ = writeln!(out, "saved: {}\n", Utc::now().to_rfc3339());

        for message in &self.messages {
            match &message.author {
                Some(author) => {
                    let _ = writeln!(out, "## {} ({})", message.role, author);
                }
                None => {
                    let _ = writeln!(out, "## {}", message.role);
                }
            }
            let _ = writeln!(out, "{}\n", message.text);
        }

        let json = serde_json::to_string_pretty(self)?;
        let _ = writeln!(out, "{}", BEGIN_MARKER);
        let _ = writeln!(out, "{}", json);
        let _ = writeln!(out, "{}", END_MARKER);
        Ok(out)
    }

    /// Parse a rendered document, reading only the embedded dump
    pub fn parse(text: &str) -> AgentResult<Self> {
        if text.lines().next().map(str::trim) != Some(SESSION_HEADER) {
            return Err(AgentError::Persistence("not a session document: missing header".to_string()));
        }

        // Markers on their own lines; the transcript may quote the words
        let begin = find_marker_line(text, BEGIN_MARKER, 0)
            .ok_or_else(|| AgentError::Persistence(format!("missing {}", BEGIN_MARKER)))?;
        let json_start = begin + BEGIN_MARKER.len();
        let end = find_marker_line(text, END_MARKER, json_start)
            .ok_or_else(|| AgentError::Persistence(format!("missing {}", END_MARKER)))?;

        serde_json::from_str(text[json_start..end].trim())
            .map_err(|e| AgentError::Persistence(format!("invalid session JSON: {}", e)))
    }
}

/// Byte offset of the last line equal to `marker` at or after `from`
fn find_marker_line(text: &str, marker: &str, from: usize) -> Option<usize> {
    let mut offset = 0;
    let mut found = None;
    for line in text.split_inclusive('\n') {
        if offset >= from && line.trim_end() == marker {
            found = Some(offset);
            if marker == END_MARKER {
                return found;
            }
        }
        offset += line.len();
    }
    found
}

/// Write a session document to `path`
pub async fn save_session(session: &dyn Session, path: impl AsRef<Path>) -> AgentResult<()> {
    let path = path.as_ref();
    let document = SessionDocument::from_session(session);
    let rendered = document.render()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, rendered).await?;
    info!(session_id = %document.session_id, path = %path.display(), messages = document.messages.len(), "Session saved");
    Ok(())
}

/// Read a session document from `path`
pub async fn load_session(path: impl AsRef<Path>) -> AgentResult<SessionDocument> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path).await?;
    let document = SessionDocument::parse(&text)?;
    info!(session_id = %document.session_id, path = %path.display(), messages = document.messages.len(), "Session loaded");
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::domain::ToolCall;
    use crate::agents::memory::InMemorySession;

    async fn sample_session() -> InMemorySession {
        let session = InMemorySession::with_id("sess-42");
        session.set_state("conversation_summary", Value::String("S1".to_string()));
        session.append(Message::user("health report please")).await.unwrap();
        session
            .append(Message::assistant_with_tools("", vec![ToolCall::new("c1", "prometheus", "{}")]))
            .await
            .unwrap();
        session.append(Message::tool_result("c1", "prometheus", "{}")).await.unwrap();
        session
            .append(Message::assistant("All green.\nBEGIN_SESSION_JSON inline").with_author("report_agent"))
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_render_then_parse_keeps_user_and_assistant() {
        let session = sample_session().await;
        let document = SessionDocument::from_session(&session);
        let rendered = document.render().unwrap();

        assert!(rendered.starts_with(SESSION_HEADER));
        assert!(rendered.contains("## assistant (report_agent)"));

        let parsed = SessionDocument::parse(&rendered).unwrap();
        assert_eq!(parsed, document);
        assert_eq!(parsed.session_id, "sess-42");
        assert_eq!(parsed.state["conversation_summary"], "S1");
        assert_eq!(parsed.messages.len(), 2);
        assert_eq!(parsed.messages[1].author.as_deref(), Some("report_agent"));
    }

    #[tokio::test]
    async fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.md");
        let session = sample_session().await;

        save_session(&session, &path).await.unwrap();
        let loaded = load_session(&path).await.unwrap();

        let messages = loaded.into_messages();
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].author(), Some("report_agent"));
        assert_eq!(messages[1].content, "All green.\nBEGIN_SESSION_JSON inline");
    }

    #[test]
    fn test_parse_rejects_foreign_documents() {
        assert!(matches!(
            SessionDocument::parse("hello\nBEGIN_SESSION_JSON\n{}\nEND_SESSION_JSON\n"),
            Err(AgentError::Persistence(_))
        ));
        let truncated = format!("{}\nBEGIN_SESSION_JSON\n{{\"session_id\":\"x\"}}\n", SESSION_HEADER);
        assert!(SessionDocument::parse(&truncated).is_err());
    }

    #[tokio::test]
    async fn test_tool_only_turns_are_not_saved() {
        let session = InMemorySession::with_id("sess-7");
        session.append(Message::user("inspect web")).await.unwrap();
        session
            .append(
                Message::assistant_with_tools(
                    "",
                    vec![ToolCall::new("c1", "handoff_to_agent", r#"{"agentName":"analysis"}"#)],
                )
                .with_author("orchestrator"),
            )
            .await
            .unwrap();
        session
            .append(Message::tool_result("c1", "handoff_to_agent", r#"{"success":true}"#))
            .await
            .unwrap();
        session
            .append(
                Message::assistant_with_tools(
                    "Checking metrics first.",
                    vec![ToolCall::new("c2", "prometheus", "{}")],
                )
                .with_author("service_agent"),
            )
            .await
            .unwrap();
        session
            .append(Message::assistant("cpu at 93%").with_author("service_agent"))
            .await
            .unwrap();

        let texts: Vec<_> = SessionDocument::from_session(&session)
            .into_messages()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(texts, vec!["inspect web", "Checking metrics first.", "cpu at 93%"]);
    }
}
