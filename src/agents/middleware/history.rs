//! Session history injection

use std::sync::Arc;

use super::{InvocationHandler, Middleware};
use crate::agents::domain::{AgentStream, Invocation, RunContext};

/// Replaces the invocation's history with the session's, when there is one
///
/// Sub-agents in a routing or sequential flow need this to see prior turns.
pub struct LoadSessionHistory;

impl Middleware for LoadSessionHistory {
    fn name(&self) -> &str {
        "load_session_history"
    }

    fn wrap(&self, next: Arc<dyn InvocationHandler>) -> Arc<dyn InvocationHandler> {
        Arc::new(HistoryHandler { next })
    }
}

struct HistoryHandler {
    next: Arc<dyn InvocationHandler>,
}

impl InvocationHandler for HistoryHandler {
    fn handle(&self, ctx: RunContext, mut invocation: Invocation) -> AgentStream {
        let session = invocation.session.clone().or_else(|| ctx.session.clone());
        if let Some(session) = session {
            let history = session.history();
            if !history.is_empty() {
                invocation.history = history;
            }
        }
        self.next.handle(ctx, invocation)
    }
}
