//! Middleware pipeline around the leaf agent's handler
//!
//! A middleware wraps the next handler and returns a new one. The pipeline is
//! assembled once when the agent is built; the first middleware in the list is
//! the outermost.

mod history;
mod logging;

pub use history::LoadSessionHistory;
pub use logging::LoggingMiddleware;

use std::sync::Arc;

use crate::agents::domain::{AgentStream, Invocation, RunContext};

/// Handles one invocation, producing the agent generator
pub trait InvocationHandler: Send + Sync {
    fn handle(&self, ctx: RunContext, invocation: Invocation) -> AgentStream;
}

/// Wraps a handler with cross-cutting behaviour
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn wrap(&self, next: Arc<dyn InvocationHandler>) -> Arc<dyn InvocationHandler>;
}

/// Wrap `core` with `middleware`, first element outermost
pub fn build_pipeline(
    core: Arc<dyn InvocationHandler>,
    middleware: &[Arc<dyn Middleware>],
) -> Arc<dyn InvocationHandler> {
    middleware
        .iter()
        .rev()
        .fold(core, |next, layer| layer.wrap(next))
}

/// The middleware every configured agent runs with
pub fn default_middleware() -> Vec<Arc<dyn Middleware>> {
    vec![Arc::new(LoggingMiddleware), Arc::new(LoadSessionHistory)]
}
