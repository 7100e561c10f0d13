//! Sequential composite

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::agents::core::Agent;
use crate::agents::domain::{AgentStream, AgentStreamSender, Message, PipeOutcome, RunContext, STREAM_BUFFER};
use crate::agents::error::AgentError;

/// Runs children in order
///
/// Each child gets the same prompt. Children share the context's session,
/// so later children see what earlier ones produced. The first failure ends
/// the whole sequence.
pub struct SequentialAgent {
    name: String,
    description: String,
    children: Vec<Arc<dyn Agent>>,
}

impl SequentialAgent {
    pub fn new(name: impl Into<String>, description: impl Into<String>, children: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            children,
        }
    }

    pub fn children(&self) -> &[Arc<dyn Agent>] {
        &self.children
    }

    async fn execute_internal(
        name: String,
        children: Vec<Arc<dyn Agent>>,
        ctx: RunContext,
        prompt: Message,
        sender: AgentStreamSender,
    ) {
        let start = Instant::now();

        for (step, child) in children.iter().enumerate() {
            if ctx.is_cancelled() {
                let _ = sender.send_error(AgentError::Cancelled).await;
                return;
            }
            debug!(agent = %name, step, child = %child.name(), "Running sequence step");

            match sender.pipe(child.run(ctx.clone(), prompt.clone())).await {
                PipeOutcome::Completed => {}
                PipeOutcome::Failed => {
                    info!(agent = %name, step, child = %child.name(), "Sequence aborted by failed step");
                    return;
                }
                PipeOutcome::Closed => return,
            }
        }

        debug!(
            agent = %name,
            steps = children.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Sequence completed"
        );
    }
}

impl Agent for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn run(&self, ctx: RunContext, prompt: Message) -> AgentStream {
        let (sender, stream) = AgentStream::channel(STREAM_BUFFER);
        let name = self.name.clone();
        let children = self.children.clone();

        tokio::spawn(async move {
            Self::execute_internal(name, children, ctx, prompt, sender).await;
        });

        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::core::LlmAgent;
    use crate::agents::domain::Role;
    use crate::agents::llm::{ScriptedProvider, ScriptedTurn};
    use crate::agents::memory::{InMemorySession, Session};
    use crate::agents::middleware::LoadSessionHistory;
    use futures::StreamExt;

    fn leaf(name: &str, provider: &ScriptedProvider) -> Arc<dyn Agent> {
        Arc::new(
            LlmAgent::builder(name, Arc::new(provider.clone()))
                .instruction(format!("You are {}.", name))
                .middleware(Arc::new(LoadSessionHistory))
                .build(),
        )
    }

    #[tokio::test]
    async fn test_children_share_session_and_prompt() {
        let first = ScriptedProvider::new(vec![ScriptedTurn::text("cpu at 93%")]);
        let second = ScriptedProvider::new(vec![ScriptedTurn::text("report: cpu high")]);
        let sequence = SequentialAgent::new(
            "analysis",
            "full inspection",
            vec![leaf("service_agent", &first), leaf("report_agent", &second)],
        );

        let session = InMemorySession::new().shared();
        session.append(Message::user("inspect")).await.unwrap();
        let ctx = RunContext::new().with_session(session.clone());

        let answer = sequence.run(ctx, Message::user("inspect")).final_message().await.unwrap();
        assert_eq!(answer.content, "report: cpu high");
        assert_eq!(answer.author(), Some("report_agent"));

        // The second child saw the first child's answer, then the prompt again
        let request = &second.requests()[0];
        let contents: Vec<_> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["You are report_agent.", "inspect", "cpu at 93%", "inspect"]);

        let history = session.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].author(), Some("service_agent"));
    }

    #[tokio::test]
    async fn test_failure_stops_sequence() {
        let first = ScriptedProvider::new(vec![ScriptedTurn::error("down")]);
        let second = ScriptedProvider::new(vec![ScriptedTurn::text("never")]);
        let sequence = SequentialAgent::new("analysis", "", vec![leaf("a", &first), leaf("b", &second)]);

        let items = sequence
            .run(RunContext::new(), Message::user("q"))
            .collect::<Vec<_>>()
            .await;
        assert!(items.last().unwrap().is_err());
        assert!(second.requests().is_empty());
        assert!(items.iter().filter_map(|i| i.as_ref().ok()).all(|m| m.role != Role::Tool));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::text("x")]);
        let sequence = SequentialAgent::new("analysis", "", vec![leaf("a", &provider)]);
        let ctx = RunContext::new();
        ctx.cancel.cancel();

        let err = sequence.run(ctx, Message::user("q")).final_message().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(provider.requests().is_empty());
    }
}
