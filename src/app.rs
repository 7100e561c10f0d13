//! Application lifecycle: bootstrap, run, shutdown

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::agents::core::{Agent, LlmAgent};
use crate::agents::domain::{AgentStream, Message, RunContext, STREAM_BUFFER};
use crate::agents::error::{AgentError, AgentResult};
use crate::agents::llm::ModelRegistry;
use crate::agents::memory::{self, LlmSummarizer, ManagedSession, SessionDocument, SharedSession, Summarizer};
use crate::agents::middleware::default_middleware;
use crate::agents::orchestration::{RoutingAgent, SequentialAgent};
use crate::agents::tool::Tool;
use crate::config::{
    ConfigError, ConfigLoader, LogSettings, Settings, GENERAL_AGENT, ORCHESTRATOR, PREDICTION_AGENT, REPORT_AGENT,
    SERVICE_AGENT,
};
use crate::prompts;
use crate::services::{self, register_builtin_services, service_types, ServiceError, ServiceRegistry};

/// Default graceful shutdown deadline
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("service initialisation failed: {0}")]
    Service(#[from] ServiceError),

    #[error("agent initialisation failed: {0}")]
    Agent(#[from] AgentError),

    #[error("logger initialisation failed: {0}")]
    Logging(String),
}

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cancel: Option<CancellationToken>,
    pub run_id: Option<String>,
}

impl RunOptions {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Closer failures collected during shutdown
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub service_errors: Vec<String>,
    pub model_errors: Vec<String>,
    /// The deadline passed before every closer finished
    pub timed_out: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.service_errors.is_empty() && self.model_errors.is_empty() && !self.timed_out
    }
}

/// The assembled assistant: registries, summariser and agent tree
pub struct App {
    settings: Arc<Settings>,
    services: Arc<ServiceRegistry>,
    models: Arc<ModelRegistry>,
    summarizer: Arc<dyn Summarizer>,
    root: Arc<dyn Agent>,
    shut_down: AtomicBool,
}

impl App {
    /// Load the configuration at `path` and build everything it describes
    pub async fn bootstrap(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let loader = ConfigLoader::new(path.as_ref());
        let settings = loader.load()?;
        init_logging(&settings.log)?;

        register_builtin_services();
        let services = ServiceRegistry::build(service_types(), settings.services.iter())?;
        let models = ModelRegistry::build(settings.agent_models())?;

        Self::assemble(settings, services, models)
    }

    /// Build the summariser and agent tree over already constructed registries
    pub fn assemble(settings: Arc<Settings>, services: ServiceRegistry, models: ModelRegistry) -> Result<Self, AppError> {
        let conversation = &settings.conversation;
        let summary_model = models.get(&conversation.summary_model_agent)?;
        let summarizer: Arc<dyn Summarizer> =
            Arc::new(LlmSummarizer::new(summary_model, conversation.summary_max_output_tokens));

        let root = build_agent_tree(&settings, &services, &models)?;
        info!(
            services = services.len(),
            models = models.len(),
            root = %root.name(),
            "Application ready"
        );

        Ok(Self {
            settings,
            services: Arc::new(services),
            models: Arc::new(models),
            summarizer,
            root,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn root(&self) -> &Arc<dyn Agent> {
        &self.root
    }

    /// A fresh managed session using the configured compression policy
    pub fn new_session(&self) -> SharedSession {
        ManagedSession::new(self.settings.conversation.policy(), self.summarizer.clone()).shared()
    }

    /// Rebuild a managed session from a persisted document
    pub fn restore_session(&self, document: SessionDocument) -> SharedSession {
        let id = document.session_id.clone();
        let state = document.state.clone();
        let history = document.into_messages();
        ManagedSession::restore(id, state, history, self.settings.conversation.policy(), self.summarizer.clone())
            .shared()
    }

    pub async fn save_session(&self, session: &SharedSession, path: impl AsRef<Path>) -> AgentResult<()> {
        memory::save_session(session.as_ref(), path).await
    }

    pub async fn load_session(&self, path: impl AsRef<Path>) -> AgentResult<SharedSession> {
        let document = memory::load_session(path).await?;
        Ok(self.restore_session(document))
    }

    /// Run one user turn and return the final assistant message
    pub async fn run(&self, session: &SharedSession, text: &str, options: RunOptions) -> AgentResult<Message> {
        self.run_stream(session, text, options).final_message().await
    }

    /// Run one user turn, streaming every message
    ///
    /// The user message is appended to the session before the orchestrator
    /// starts.
    pub fn run_stream(&self, session: &SharedSession, text: &str, options: RunOptions) -> AgentStream {
        if self.shut_down.load(Ordering::SeqCst) {
            return AgentStream::from_error(AgentError::Internal("application is shut down".to_string()));
        }

        let mut ctx = RunContext::new().with_session(session.clone());
        if let Some(cancel) = options.cancel {
            ctx = ctx.with_cancel(cancel);
        }
        if let Some(run_id) = options.run_id {
            ctx.run_id = run_id;
        }

        let prompt = Message::user(text);
        let root = self.root.clone();
        let session = session.clone();
        let (sender, stream) = AgentStream::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            debug!(run_id = %ctx.run_id, session_id = %session.id(), "Run started");
            if let Err(e) = session.append(prompt.clone()).await {
                let _ = sender.send_error(e).await;
                return;
            }
            let outcome = sender.pipe(root.run(ctx.clone(), prompt)).await;
            debug!(run_id = %ctx.run_id, session_id = %session.id(), ?outcome, "Run finished");
        });

        stream
    }

    /// Health of every service, by name
    pub async fn health(&self) -> Vec<(String, Result<(), ServiceError>)> {
        self.services.health_all().await
    }

    /// Close services, then models, within `deadline`
    ///
    /// Individual closer failures are collected, not propagated. Only the
    /// first call does any work.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Application already shut down");
            return ShutdownReport::default();
        }

        let services = self.services.clone();
        let models = self.models.clone();
        let mut report = ShutdownReport::default();

        let close = async {
            let service_errors = services.close_all().await;
            let model_errors = models.close_all().await;
            (service_errors, model_errors)
        };
        match tokio::time::timeout(deadline, close).await {
            Ok((service_errors, model_errors)) => {
                report.service_errors = service_errors;
                report.model_errors = model_errors;
            }
            Err(_) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Shutdown deadline exceeded");
                report.timed_out = true;
            }
        }

        info!(
            service_errors = report.service_errors.len(),
            model_errors = report.model_errors.len(),
            timed_out = report.timed_out,
            "Application shut down"
        );
        report
    }
}

/// Build the leaves, the `analysis` sequence and the routing orchestrator
fn build_agent_tree(
    settings: &Settings,
    services: &ServiceRegistry,
    models: &ModelRegistry,
) -> Result<Arc<dyn Agent>, AppError> {
    let leaf = |name: &str,
                description: &str,
                instruction: &str,
                tools: Vec<Arc<dyn Tool>>|
     -> AgentResult<Option<Arc<dyn Agent>>> {
        if settings.agent(name).is_none() {
            return Ok(None);
        }
        let mut builder = LlmAgent::builder(name, models.get(name)?)
            .description(description)
            .instruction(instruction)
            .tools(tools);
        for layer in default_middleware() {
            builder = builder.middleware(layer);
        }
        let agent: Arc<dyn Agent> = Arc::new(builder.build());
        Ok(Some(agent))
    };

    let service_agent = leaf(
        SERVICE_AGENT,
        prompts::SERVICE_AGENT_DESCRIPTION,
        prompts::SERVICE_AGENT_INSTRUCTION,
        services.tools(),
    )?;
    let prediction_agent = leaf(
        PREDICTION_AGENT,
        prompts::PREDICTION_AGENT_DESCRIPTION,
        prompts::PREDICTION_AGENT_INSTRUCTION,
        services.tools_of_type(services::prometheus::SERVICE_TYPE),
    )?;
    let report_agent = leaf(
        REPORT_AGENT,
        prompts::REPORT_AGENT_DESCRIPTION,
        prompts::REPORT_AGENT_INSTRUCTION,
        Vec::new(),
    )?;
    let general_agent = leaf(
        GENERAL_AGENT,
        prompts::GENERAL_AGENT_DESCRIPTION,
        prompts::GENERAL_AGENT_INSTRUCTION,
        Vec::new(),
    )?;

    let steps: Vec<Arc<dyn Agent>> = [&service_agent, &prediction_agent, &report_agent]
        .into_iter()
        .flatten()
        .cloned()
        .collect();

    let mut children: Vec<Arc<dyn Agent>> = Vec::new();
    if !steps.is_empty() {
        children.push(Arc::new(SequentialAgent::new(
            prompts::ANALYSIS_NAME,
            prompts::ANALYSIS_DESCRIPTION,
            steps,
        )));
    }
    children.extend([service_agent, prediction_agent, report_agent, general_agent].into_iter().flatten());

    let names: Vec<&str> = children.iter().map(|c| c.name()).collect();
    info!(children = ?names, "Agent tree built");

    Ok(Arc::new(RoutingAgent::new(
        ORCHESTRATOR,
        prompts::ORCHESTRATOR_DESCRIPTION,
        models.get(ORCHESTRATOR)?,
        prompts::ORCHESTRATOR_INSTRUCTION,
        children,
        default_middleware(),
    )))
}

/// Install the global subscriber from `log.*`
///
/// `RUST_LOG`, when set, overrides `log.level`. A subscriber that is already
/// installed is kept.
pub fn init_logging(log: &LogSettings) -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if log.output == "stdout" {
        match log.format.as_str() {
            "json" => registry.with(fmt::layer().json()).try_init(),
            _ => registry.with(fmt::layer()).try_init(),
        }
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.output)
            .map_err(|e| AppError::Logging(format!("cannot open log file {}: {}", log.output, e)))?;
        let writer = Mutex::new(file);
        match log.format.as_str() {
            "json" => registry.with(fmt::layer().json().with_writer(writer)).try_init(),
            _ => registry.with(fmt::layer().with_ansi(false).with_writer(writer)).try_init(),
        }
    };

    if let Err(e) = result {
        debug!("Global logger already installed: {}", e);
    }
    Ok(())
}
