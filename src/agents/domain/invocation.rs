//! Request-scoped context and the per-turn invocation bundle

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Message, Role, ToolDefinition};
use crate::agents::memory::SharedSession;
use crate::agents::tool::Tool;

/// Request-scoped context threaded through every agent of one run
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub session: Option<SharedSession>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            session: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_session(mut self, session: SharedSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a leaf agent needs for one turn
///
/// Built by the leaf agent and passed through its middleware pipeline. The
/// core handler treats it as immutable.
#[derive(Clone)]
pub struct Invocation {
    pub invocation_id: String,
    pub agent_name: String,
    /// Model identifier used for this turn
    pub model: String,
    /// Rendered system instruction
    pub instruction: String,
    pub prompt: Message,
    pub history: Vec<Message>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub session: Option<SharedSession>,
}

impl Invocation {
    pub fn new(agent_name: impl Into<String>, model: impl Into<String>, prompt: Message) -> Self {
        Self {
            invocation_id: Uuid::new_v4().to_string(),
            agent_name: agent_name.into(),
            model: model.into(),
            instruction: String::new(),
            prompt,
            history: Vec::new(),
            tools: Vec::new(),
            session: None,
        }
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Compose the model request: instruction, sanitised history, then the prompt
    ///
    /// The prompt is not repeated when the history already holds it as the
    /// open question: the last user message, with no final answer after it.
    /// That is the case when the history was loaded from a session that
    /// recorded it, including after a routing handoff.
    pub fn compose_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if !self.instruction.is_empty() {
            messages.push(Message::system(&self.instruction));
        }
        messages.extend(sanitize_history(&self.history));

        if !self.prompt_is_open() {
            messages.push(self.prompt.clone());
        }
        messages
    }

    fn prompt_is_open(&self) -> bool {
        let Some(pos) = self.history.iter().rposition(|m| m.role == Role::User) else {
            return false;
        };
        self.history[pos].content == self.prompt.content
            && !self.history[pos + 1..].iter().any(Message::is_final_answer)
    }
}

/// Drop tool calls without responses and responses without calls
///
/// Orphaned calls are left behind by failed turns; providers reject them.
pub fn sanitize_history(history: &[Message]) -> Vec<Message> {
    use std::collections::HashSet;

    let answered: HashSet<&str> = history
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    let requested: HashSet<&str> = history
        .iter()
        .flat_map(|m| m.calls().iter().map(|c| c.id.as_str()))
        .collect();

    history
        .iter()
        .filter(|m| m.is_completed())
        .filter_map(|m| match m.role {
            Role::Tool => {
                let id = m.tool_call_id.as_deref()?;
                requested.contains(id).then(|| m.clone())
            }
            Role::Assistant if m.has_tool_calls() => {
                let calls: Vec<_> = m
                    .calls()
                    .iter()
                    .filter(|c| answered.contains(c.id.as_str()))
                    .cloned()
                    .collect();
                if calls.is_empty() && m.content.is_empty() {
                    None
                } else {
                    let mut kept = m.clone();
                    kept.tool_calls = if calls.is_empty() { None } else { Some(calls) };
                    Some(kept)
                }
            }
            _ => Some(m.clone()),
        })
        .collect()
}
