//! Leaf agent: the model/tool loop

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde_json::json;
use tracing::{debug, warn};

use super::{render_system_prompt, Agent, ChildSummary};
use crate::agents::domain::{
    AgentStream, AgentStreamSender, Invocation, Message, RunContext, TokenUsage, ToolCall, STREAM_BUFFER,
};
use crate::agents::error::AgentError;
use crate::agents::llm::{CompletionRequest, LlmProvider, ToolCallAccumulator};
use crate::agents::middleware::{build_pipeline, InvocationHandler, Middleware};
use crate::agents::tool::{Tool, ToolContext};

/// Model rounds allowed per turn before giving up
pub const MAX_TOOL_ROUNDS: u32 = 10;

/// Agent bound to one model, a tool list and a middleware pipeline
pub struct LlmAgent {
    name: String,
    description: String,
    instruction: String,
    children: Vec<ChildSummary>,
    model: Arc<dyn LlmProvider>,
    tools: Vec<Arc<dyn Tool>>,
    pipeline: Arc<dyn InvocationHandler>,
}

impl LlmAgent {
    pub fn builder(name: impl Into<String>, model: Arc<dyn LlmProvider>) -> LlmAgentBuilder {
        LlmAgentBuilder {
            name: name.into(),
            description: String::new(),
            instruction: String::new(),
            children: Vec::new(),
            model,
            tools: Vec::new(),
            middleware: Vec::new(),
        }
    }

    pub fn model(&self) -> &Arc<dyn LlmProvider> {
        &self.model
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }
}

impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn run(&self, ctx: RunContext, prompt: Message) -> AgentStream {
        let mut invocation = Invocation::new(&self.name, self.model.model(), prompt);
        invocation.instruction = render_system_prompt(&self.instruction, &self.name, &self.children);
        invocation.tools = self.tools.clone();
        invocation.session = ctx.session.clone();
        self.pipeline.handle(ctx, invocation)
    }
}

pub struct LlmAgentBuilder {
    name: String,
    description: String,
    instruction: String,
    children: Vec<ChildSummary>,
    model: Arc<dyn LlmProvider>,
    tools: Vec<Arc<dyn Tool>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl LlmAgentBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// System instruction template (see [`render_system_prompt`])
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Agents listed to the instruction template as `children`
    pub fn children(mut self, children: Vec<ChildSummary>) -> Self {
        self.children = children;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Add a middleware; the first one added is the outermost
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn build(self) -> LlmAgent {
        let core = Arc::new(ModelHandler::new(self.model.clone()));
        let pipeline = build_pipeline(core, &self.middleware);
        LlmAgent {
            name: self.name,
            description: self.description,
            instruction: self.instruction,
            children: self.children,
            model: self.model,
            tools: self.tools,
            pipeline,
        }
    }
}

/// Innermost handler: drives the model and executes tool calls
pub struct ModelHandler {
    model: Arc<dyn LlmProvider>,
}

impl ModelHandler {
    pub fn new(model: Arc<dyn LlmProvider>) -> Self {
        Self { model }
    }

    async fn execute_internal(
        model: Arc<dyn LlmProvider>,
        ctx: RunContext,
        invocation: Invocation,
        sender: AgentStreamSender,
    ) {
        match Self::tool_loop(&model, &ctx, &invocation, &sender).await {
            Ok(()) | Err(Halt::Closed) => {}
            Err(Halt::Failed(e)) => {
                let _ = sender.send_error(e).await;
            }
        }
    }

    async fn tool_loop(
        model: &Arc<dyn LlmProvider>,
        ctx: &RunContext,
        invocation: &Invocation,
        sender: &AgentStreamSender,
    ) -> Result<(), Halt> {
        let author = invocation.agent_name.as_str();
        let definitions = invocation.tool_definitions();
        let mut working = invocation.compose_messages();

        for round in 0..MAX_TOOL_ROUNDS {
            if ctx.is_cancelled() {
                return Err(AgentError::Cancelled.into());
            }

            let mut request = CompletionRequest::new(working.clone());
            if !definitions.is_empty() {
                request = request.with_tools(definitions.clone());
            }

            let (content, calls, usage) = Self::stream_round(model, ctx, request, author, sender).await?;
            let assistant = Message::assistant_with_tools(content, calls.clone())
                .with_author(author)
                .with_usage(usage);
            Self::emit(ctx, sender, assistant.clone()).await?;

            if calls.is_empty() {
                return Ok(());
            }
            debug!(agent = %author, round, calls = calls.len(), "Executing tool calls");
            working.push(assistant);

            let mut end_turn = false;
            for call in &calls {
                let (result, ended) = Self::call_tool(ctx, invocation, call).await?;
                end_turn |= ended;
                working.push(result.clone());
                Self::emit(ctx, sender, result).await?;
            }
            if end_turn {
                return Ok(());
            }
        }

        Err(AgentError::MaxIterations(MAX_TOOL_ROUNDS).into())
    }

    /// Stream one model generation, forwarding text deltas as they arrive
    async fn stream_round(
        model: &Arc<dyn LlmProvider>,
        ctx: &RunContext,
        request: CompletionRequest,
        author: &str,
        sender: &AgentStreamSender,
    ) -> Result<(String, Vec<ToolCall>, Option<TokenUsage>), Halt> {
        let mut stream = model.complete_stream(request);
        let mut content = String::new();
        let mut accumulator = ToolCallAccumulator::new();
        let mut usage = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled.into()),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(AgentError::from)?;

            if !chunk.content.is_empty() {
                content.push_str(&chunk.content);
                sender
                    .send(Message::streaming(&chunk.content).with_author(author))
                    .await
                    .map_err(|_| Halt::Closed)?;
            }
            for delta in &chunk.tool_calls {
                accumulator.apply_delta(delta);
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
        }

        Ok((content, accumulator.build(), usage))
    }

    /// Run one tool call and build its response message
    ///
    /// Schema mismatches and unknown tools are folded into the result so the
    /// model can retry; any other tool failure aborts the turn.
    async fn call_tool(ctx: &RunContext, invocation: &Invocation, call: &ToolCall) -> Result<(Message, bool), Halt> {
        let tool_ctx = ToolContext::new(&call.id, ctx.cancel.clone(), ctx.session.clone());
        let start = Instant::now();

        let output = match invocation.tool(&call.name) {
            None => {
                warn!(agent = %invocation.agent_name, tool = %call.name, "Model called an unknown tool");
                json!({"success": false, "message": format!("unknown tool: {}", call.name)}).to_string()
            }
            Some(tool) => match tool.call(&tool_ctx, &call.arguments).await {
                Ok(output) => output,
                Err(AgentError::InvalidInput { message, .. }) => {
                    warn!(agent = %invocation.agent_name, tool = %call.name, error = %message, "Invalid tool input");
                    json!({"success": false, "message": format!("invalid input: {}", message)}).to_string()
                }
                Err(e) => return Err(e.into()),
            },
        };
        debug!(
            agent = %invocation.agent_name,
            tool = %call.name,
            call_id = %call.id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Tool call finished"
        );

        let mut message = Message::tool_result(&call.id, &call.name, output);
        message.actions = tool_ctx.actions();
        Ok((message, tool_ctx.ends_turn()))
    }

    /// Append a completed message to the session, then yield it
    async fn emit(ctx: &RunContext, sender: &AgentStreamSender, message: Message) -> Result<(), Halt> {
        if let Some(session) = &ctx.session {
            session.append(message.clone()).await?;
        }
        sender.send(message).await.map_err(|_| Halt::Closed)
    }
}

impl InvocationHandler for ModelHandler {
    fn handle(&self, ctx: RunContext, invocation: Invocation) -> AgentStream {
        let (sender, stream) = AgentStream::channel(STREAM_BUFFER);
        let model = self.model.clone();
        tokio::spawn(async move {
            Self::execute_internal(model, ctx, invocation, sender).await;
        });
        stream
    }
}

/// Why the loop stopped early
enum Halt {
    /// The consumer dropped the stream
    Closed,
    Failed(AgentError),
}

impl From<AgentError> for Halt {
    fn from(err: AgentError) -> Self {
        Halt::Failed(err)
    }
}
