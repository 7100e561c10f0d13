//! Invocation logging

use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use super::{InvocationHandler, Middleware};
use crate::agents::domain::{AgentStream, Invocation, Role, RunContext, STREAM_BUFFER};

/// Records start, completion and failure of every invocation, plus each tool call
///
/// Errors are logged and forwarded unchanged.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn wrap(&self, next: Arc<dyn InvocationHandler>) -> Arc<dyn InvocationHandler> {
        Arc::new(LoggingHandler { next })
    }
}

struct LoggingHandler {
    next: Arc<dyn InvocationHandler>,
}

impl InvocationHandler for LoggingHandler {
    fn handle(&self, ctx: RunContext, invocation: Invocation) -> AgentStream {
        let invocation_id = invocation.invocation_id.clone();
        let agent = invocation.agent_name.clone();
        let model = invocation.model.clone();
        let run_id = ctx.run_id.clone();

        info!(
            invocation_id = %invocation_id,
            run_id = %run_id,
            agent = %agent,
            model = %model,
            history = invocation.history.len(),
            tools = invocation.tools.len(),
            "agent invocation started"
        );

        let start = Instant::now();
        let mut inner = self.next.handle(ctx, invocation);
        let (sender, stream) = AgentStream::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let mut messages = 0usize;
            while let Some(item) = inner.next().await {
                match &item {
                    Ok(message) if message.is_completed() => {
                        messages += 1;
                        for call in message.calls() {
                            info!(
                                invocation_id = %invocation_id,
                                agent = %agent,
                                tool = %call.name,
                                call_id = %call.id,
                                arguments = %call.arguments,
                                "tool call requested"
                            );
                        }
                        if message.role == Role::Tool {
                            debug!(
                                invocation_id = %invocation_id,
                                agent = %agent,
                                tool = message.author().unwrap_or_default(),
                                call_id = message.tool_call_id.as_deref().unwrap_or_default(),
                                bytes = message.content.len(),
                                "tool call finished"
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            invocation_id = %invocation_id,
                            agent = %agent,
                            duration_ms = start.elapsed().as_millis() as u64,
                            messages,
                            cancelled = e.is_cancelled(),
                            error = %e,
                            "agent invocation failed"
                        );
                    }
                }

                let failed = item.is_err();
                let forwarded = match item {
                    Ok(message) => sender.send(message).await,
                    Err(e) => sender.send_error(e).await,
                };
                if forwarded.is_err() {
                    debug!(invocation_id = %invocation_id, agent = %agent, "consumer dropped the stream");
                    return;
                }
                if failed {
                    return;
                }
            }

            info!(
                invocation_id = %invocation_id,
                agent = %agent,
                duration_ms = start.elapsed().as_millis() as u64,
                messages,
                "agent invocation completed"
            );
        });

        stream
    }
}
