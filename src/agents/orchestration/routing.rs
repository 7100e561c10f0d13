//! Routing composite
//!
//! The router is an internal leaf agent whose only tool is `handoff_to_agent`.
//! It either answers directly or names one child, which then takes over the
//! rest of the turn.

use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::agents::core::{Agent, ChildSummary, LlmAgent};
use crate::agents::domain::{AgentStream, AgentStreamSender, Message, RunContext, ToolDefinition, STREAM_BUFFER};
use crate::agents::error::AgentError;
use crate::agents::llm::LlmProvider;
use crate::agents::middleware::Middleware;
use crate::agents::tool::{FunctionTool, Tool};

/// Name of the reserved routing tool
pub const HANDOFF_TOOL: &str = "handoff_to_agent";

/// Action key the routing tool writes the chosen agent name under
pub const HANDOFF_ACTION: &str = "handoff_to_agent";

#[derive(Deserialize)]
struct HandoffArgs {
    #[serde(rename = "agentName")]
    agent_name: String,
}

/// Build the reserved handoff tool offering `targets`
///
/// The tool produces no output. It records the chosen name as an action and
/// ends the router's turn.
pub fn handoff_tool(targets: &[String]) -> Arc<dyn Tool> {
    let definition = ToolDefinition::new(
        HANDOFF_TOOL,
        "Transfer the conversation to the named agent, which will answer the user.",
        json!({
            "type": "object",
            "properties": {
                "agentName": {
                    "type": "string",
                    "enum": targets,
                    "description": "Name of the agent to hand off to"
                }
            },
            "required": ["agentName"],
            "additionalProperties": false
        }),
    );

    Arc::new(FunctionTool::new(definition, |ctx, input| {
        async move {
            let args: HandoffArgs = serde_json::from_str(&input).map_err(|e| AgentError::InvalidInput {
                tool: HANDOFF_TOOL.to_string(),
                message: e.to_string(),
            })?;
            ctx.set_action(HANDOFF_ACTION, Value::String(args.agent_name));
            ctx.end_turn();
            Ok(String::new())
        }
        .boxed()
    }))
}

/// Lets a model choose at most one child per turn
pub struct RoutingAgent {
    name: String,
    description: String,
    router: Arc<LlmAgent>,
    children: Vec<Arc<dyn Agent>>,
}

impl RoutingAgent {
    /// `instruction` is rendered with the children's names and descriptions
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        model: Arc<dyn LlmProvider>,
        instruction: impl Into<String>,
        children: Vec<Arc<dyn Agent>>,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        let name = name.into();
        let description = description.into();
        let summaries: Vec<ChildSummary> = children.iter().map(|c| ChildSummary::of(c.as_ref())).collect();
        let targets: Vec<String> = summaries.iter().map(|c| c.name.clone()).collect();

        let mut builder = LlmAgent::builder(&name, model)
            .description(&description)
            .instruction(instruction)
            .children(summaries)
            .tool(handoff_tool(&targets));
        for layer in middleware {
            builder = builder.middleware(layer);
        }

        Self {
            name,
            description,
            router: Arc::new(builder.build()),
            children,
        }
    }

    pub fn children(&self) -> &[Arc<dyn Agent>] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&Arc<dyn Agent>> {
        self.children.iter().find(|c| c.name() == name)
    }

    async fn execute_internal(
        name: String,
        router: Arc<LlmAgent>,
        children: Vec<Arc<dyn Agent>>,
        ctx: RunContext,
        prompt: Message,
        sender: AgentStreamSender,
    ) {
        let mut inner = router.run(ctx.clone(), prompt.clone());
        let mut target = None;

        while let Some(item) = inner.next().await {
            let message = match item {
                Ok(message) => message,
                Err(e) => {
                    let _ = sender.send_error(e).await;
                    return;
                }
            };
            let handoff = message.action(HANDOFF_ACTION).and_then(Value::as_str).map(str::to_string);
            if sender.send(message).await.is_err() {
                return;
            }
            if handoff.is_some() {
                target = handoff;
                break;
            }
        }
        // Stop driving the router once a target is chosen
        drop(inner);

        let Some(target) = target else {
            return;
        };
        let child = if target == name {
            None
        } else {
            children.iter().find(|c| c.name() == target)
        };
        let Some(child) = child else {
            warn!(agent = %name, target = %target, "Handoff to unknown agent");
            let _ = sender.send_error(AgentError::TargetNotFound(target)).await;
            return;
        };
        if ctx.is_cancelled() {
            let _ = sender.send_error(AgentError::Cancelled).await;
            return;
        }

        info!(agent = %name, target = %target, run_id = %ctx.run_id, "Handing off");
        sender.pipe(child.run(ctx, prompt)).await;
    }
}

impl Agent for RoutingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn run(&self, ctx: RunContext, prompt: Message) -> AgentStream {
        let (sender, stream) = AgentStream::channel(STREAM_BUFFER);
        let name = self.name.clone();
        let router = self.router.clone();
        let children = self.children.clone();

        tokio::spawn(async move {
            Self::execute_internal(name, router, children, ctx, prompt, sender).await;
        });

        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::domain::Role;
    use crate::agents::llm::{ScriptedProvider, ScriptedTurn};
    use crate::agents::memory::{InMemorySession, Session};
    use crate::agents::middleware::LoadSessionHistory;

    fn leaf(name: &str, provider: &ScriptedProvider) -> Arc<dyn Agent> {
        Arc::new(
            LlmAgent::builder(name, Arc::new(provider.clone()))
                .description(format!("{} agent", name))
                .middleware(Arc::new(LoadSessionHistory))
                .build(),
        )
    }

    fn router(turns: Vec<ScriptedTurn>, children: Vec<Arc<dyn Agent>>) -> (RoutingAgent, ScriptedProvider) {
        let provider = ScriptedProvider::new(turns);
        let agent = RoutingAgent::new(
            "orchestrator",
            "routes requests",
            Arc::new(provider.clone()),
            "Pick one of:{% for c in children %} {{ c.name }}{% endfor %}",
            children,
            vec![Arc::new(LoadSessionHistory)],
        );
        (agent, provider)
    }

    #[tokio::test]
    async fn test_handoff_pipes_child_output() {
        let a = ScriptedProvider::new(vec![ScriptedTurn::text("a answered")]);
        let b = ScriptedProvider::new(vec![]);
        let (agent, provider) = router(vec![ScriptedTurn::handoff("a")], vec![leaf("a", &a), leaf("b", &b)]);

        let messages = agent
            .run(RunContext::new(), Message::user("hello"))
            .collect_messages()
            .await
            .unwrap();

        let handoff = messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(handoff.content, "");
        assert_eq!(handoff.action(HANDOFF_ACTION), Some(&json!("a")));
        let last = messages.last().unwrap();
        assert_eq!(last.content, "a answered");
        assert_eq!(last.author(), Some("a"));
        assert!(b.requests().is_empty());

        let request = &provider.requests()[0];
        assert_eq!(request.messages[0].content, "Pick one of: a b");
        let tools = request.tools.as_ref().unwrap();
        assert_eq!(tools[0].name, HANDOFF_TOOL);
        assert_eq!(tools[0].parameters["properties"]["agentName"]["enum"], json!(["a", "b"]));
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn test_unknown_target_fails() {
        let a = ScriptedProvider::new(vec![]);
        let b = ScriptedProvider::new(vec![]);
        let (agent, _) = router(vec![ScriptedTurn::handoff("c")], vec![leaf("a", &a), leaf("b", &b)]);

        let items: Vec<_> = agent.run(RunContext::new(), Message::user("hello")).collect().await;
        assert!(matches!(items.last(), Some(Err(AgentError::TargetNotFound(name))) if name == "c"));
        assert_eq!(items.iter().filter(|i| i.is_err()).count(), 1);
        assert!(a.requests().is_empty());
        assert!(b.requests().is_empty());
    }

    #[tokio::test]
    async fn test_handoff_to_self_is_rejected() {
        let a = ScriptedProvider::new(vec![]);
        let (agent, _) = router(vec![ScriptedTurn::handoff("orchestrator")], vec![leaf("a", &a)]);

        let err = agent
            .run(RunContext::new(), Message::user("hello"))
            .final_message()
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TargetNotFound(name) if name == "orchestrator"));
    }

    #[tokio::test]
    async fn test_direct_answer_invokes_no_child() {
        let a = ScriptedProvider::new(vec![]);
        let (agent, _) = router(vec![ScriptedTurn::text("hi there")], vec![leaf("a", &a)]);

        let answer = agent
            .run(RunContext::new(), Message::user("hello"))
            .final_message()
            .await
            .unwrap();
        assert_eq!(answer.content, "hi there");
        assert_eq!(answer.author(), Some("orchestrator"));
        assert!(a.requests().is_empty());
    }

    #[tokio::test]
    async fn test_first_handoff_wins() {
        let a = ScriptedProvider::new(vec![ScriptedTurn::text("from a")]);
        let b = ScriptedProvider::new(vec![ScriptedTurn::text("from b")]);
        let turn = ScriptedTurn::handoff("a").and_call(HANDOFF_TOOL, r#"{"agentName":"b"}"#);
        let (agent, _) = router(vec![turn], vec![leaf("a", &a), leaf("b", &b)]);

        let answer = agent
            .run(RunContext::new(), Message::user("hello"))
            .final_message()
            .await
            .unwrap();
        assert_eq!(answer.content, "from a");
        assert!(b.requests().is_empty());
    }

    #[tokio::test]
    async fn test_child_sees_session_without_duplicate_prompt() {
        let a = ScriptedProvider::new(vec![ScriptedTurn::text("done")]);
        let (agent, _) = router(vec![ScriptedTurn::handoff("a")], vec![leaf("a", &a)]);

        let session = InMemorySession::new().shared();
        session.append(Message::user("check cpu")).await.unwrap();
        let ctx = RunContext::new().with_session(session.clone());
        agent.run(ctx, Message::user("check cpu")).final_message().await.unwrap();

        let request = &a.requests()[0];
        let prompts = request.messages.iter().filter(|m| m.role == Role::User).count();
        assert_eq!(prompts, 1);
        assert_eq!(request.messages.last().unwrap().role, Role::Tool);

        let history = session.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].content, "done");
    }
}
