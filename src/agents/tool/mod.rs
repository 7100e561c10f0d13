//! Tool protocol
//!
//! A tool is a JSON-schema-described function the model may call inside a
//! turn. Handlers receive the raw JSON input and a per-call [`ToolContext`].

mod service_tool;

pub use service_tool::{inline_schema, schema_with_operations, ServiceTool};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::agents::domain::ToolDefinition;
use crate::agents::error::AgentResult;
use crate::agents::memory::SharedSession;

/// A function the model can call
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Name, description, input schema and optional output schema
    fn definition(&self) -> ToolDefinition;

    /// Run the handler
    ///
    /// Fails with `InvalidInput` when `input` does not match the schema and
    /// with `ToolExecution` when the handler itself fails.
    async fn call(&self, ctx: &ToolContext, input: &str) -> AgentResult<String>;
}

/// Per-call side channel between a tool and the agent running it
pub struct ToolContext {
    call_id: String,
    cancel: CancellationToken,
    session: Option<SharedSession>,
    actions: Mutex<HashMap<String, Value>>,
    end_turn: AtomicBool,
}

impl ToolContext {
    pub fn new(call_id: impl Into<String>, cancel: CancellationToken, session: Option<SharedSession>) -> Self {
        Self {
            call_id: call_id.into(),
            cancel,
            session,
            actions: Mutex::new(HashMap::new()),
            end_turn: AtomicBool::new(false),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn session(&self) -> Option<&SharedSession> {
        self.session.as_ref()
    }

    /// Raise a control action; the agent copies it onto the tool-response message
    pub fn set_action(&self, key: impl Into<String>, value: Value) {
        self.actions.lock().insert(key.into(), value);
    }

    pub fn actions(&self) -> HashMap<String, Value> {
        self.actions.lock().clone()
    }

    /// Ask the agent to stop after this tool round instead of calling the model again
    pub fn end_turn(&self) {
        self.end_turn.store(true, Ordering::SeqCst);
    }

    pub fn ends_turn(&self) -> bool {
        self.end_turn.load(Ordering::SeqCst)
    }
}

type Handler = dyn for<'a> Fn(&'a ToolContext, String) -> BoxFuture<'a, AgentResult<String>> + Send + Sync;

/// Tool backed by a closure
pub struct FunctionTool {
    definition: ToolDefinition,
    handler: Arc<Handler>,
}

impl FunctionTool {
    pub fn new<F>(definition: ToolDefinition, handler: F) -> Self
    where
        F: for<'a> Fn(&'a ToolContext, String) -> BoxFuture<'a, AgentResult<String>> + Send + Sync + 'static,
    {
        Self {
            definition,
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn call(&self, ctx: &ToolContext, input: &str) -> AgentResult<String> {
        (self.handler)(ctx, input.to_string()).await
    }
}
