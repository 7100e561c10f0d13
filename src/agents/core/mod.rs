//! Agent trait and the leaf agent
//!
//! - `LlmAgent`: model + tools + instruction, with a tool-calling loop
//!
//! Composites live in `orchestration`.

mod leaf;

pub use leaf::{LlmAgent, LlmAgentBuilder, ModelHandler, MAX_TOOL_ROUNDS};

use chrono::Utc;
use serde::Serialize;
use tera::{Context, Tera};

use crate::agents::domain::{AgentStream, Message, RunContext};

/// A named unit of behaviour producing a lazy sequence of messages
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Human description, consumed by routing prompts
    fn description(&self) -> &str;

    /// Run one turn for `prompt`
    ///
    /// Streaming deltas carry `status = streaming`; every completed message
    /// has already been appended to the context's session when it is yielded.
    fn run(&self, ctx: RunContext, prompt: Message) -> AgentStream;
}

/// Name and description of an agent a router may hand off to
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChildSummary {
    pub name: String,
    pub description: String,
}

impl ChildSummary {
    pub fn of(agent: &dyn Agent) -> Self {
        Self {
            name: agent.name().to_string(),
            description: agent.description().to_string(),
        }
    }
}

/// Render a system instruction as a Tera template
///
/// Available variables: `agent_name`, `now` (UTC, RFC 3339) and `children`
/// (list of `{name, description}`). Falls back to the raw template if
/// rendering fails.
pub fn render_system_prompt(template: &str, agent_name: &str, children: &[ChildSummary]) -> String {
    if !template.contains("{{") && !template.contains("{%") {
        return template.to_string();
    }

    let mut context = Context::new();
    context.insert("agent_name", agent_name);
    context.insert("now", &Utc::now().to_rfc3339());
    context.insert("children", children);

    match Tera::one_off(template, &context, false) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!(agent = %agent_name, "Failed to render system prompt template: {}", e);
            template.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_children() {
        let children = vec![
            ChildSummary {
                name: "analysis".to_string(),
                description: "full inspection".to_string(),
            },
            ChildSummary {
                name: "general_agent".to_string(),
                description: "small talk".to_string(),
            },
        ];
        let rendered = render_system_prompt(
            "I am {{ agent_name }}.{% for c in children %}\n- {{ c.name }}: {{ c.description }}{% endfor %}",
            "orchestrator",
            &children,
        );
        assert_eq!(
            rendered,
            "I am orchestrator.\n- analysis: full inspection\n- general_agent: small talk"
        );
    }

    #[test]
    fn test_plain_and_broken_templates_pass_through() {
        assert_eq!(render_system_prompt("plain", "a", &[]), "plain");
        assert_eq!(render_system_prompt("{{ unclosed", "a", &[]), "{{ unclosed");
    }

    #[test]
    fn test_now_is_rendered() {
        let rendered = render_system_prompt("{{ now }}", "a", &[]);
        assert!(chrono::DateTime::parse_from_rfc3339(&rendered).is_ok());
    }
}
