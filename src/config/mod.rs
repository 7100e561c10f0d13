use config::{Config, File, FileFormat};
use once_cell::sync::OnceCell;
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

mod env;
pub mod validator;

pub use env::expand_env;
pub use validator::{ConfigValidator, ValidationError};

use crate::agents::config::LlmProviderConfig;
use crate::agents::memory::CompressionPolicy;
use crate::services::ServiceConfig;

pub const ORCHESTRATOR: &str = "orchestrator";
pub const SERVICE_AGENT: &str = "service_agent";
pub const PREDICTION_AGENT: &str = "prediction_agent";
pub const REPORT_AGENT: &str = "report_agent";
pub const GENERAL_AGENT: &str = "general_agent";

/// Every agent the application knows how to build
pub const AGENT_NAMES: [&str; 5] = [ORCHESTRATOR, SERVICE_AGENT, PREDICTION_AGENT, REPORT_AGENT, GENERAL_AGENT];

const TOP_LEVEL_KEYS: [&str; 5] = ["server", "log", "conversation", "agents", "services"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("unknown top-level key: {0}")]
    UnknownKey(String),

    #[error("configuration validation failed:\n{}", list_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("configuration has not been loaded")]
    NotLoaded,

    #[error("configuration is already loaded")]
    AlreadyLoaded,
}

fn list_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub log: LogSettings,
    pub conversation: ConversationSettings,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSettings>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// `host:port` for the HTTP endpoints
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// debug, info, warn or error
    pub level: String,
    /// text or json
    pub format: String,
    /// `stdout` or a file path
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSettings {
    pub context_window_tokens: u32,
    pub compression_threshold: f64,
    pub max_in_context_messages: usize,
    pub retain_recent_messages: usize,
    pub summary_max_output_tokens: u32,
    /// Agent whose model writes conversation summaries
    pub summary_model_agent: String,
}

impl ConversationSettings {
    pub fn policy(&self) -> CompressionPolicy {
        CompressionPolicy {
            context_window_tokens: self.context_window_tokens,
            compression_threshold: self.compression_threshold,
            max_in_context_messages: self.max_in_context_messages,
            retain_recent_messages: self.retain_recent_messages,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub llm: Option<LlmProviderConfig>,
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Parse a TOML document: expand placeholders, apply defaults, validate,
    /// then drop disabled agents and services
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env(raw);

        let s = Config::builder()
            .set_default("server.addr", "127.0.0.1:8080")?
            .set_default("log.level", "info")?
            .set_default("log.format", "text")?
            .set_default("log.output", "stdout")?
            .set_default("conversation.context_window_tokens", 128_000)?
            .set_default("conversation.compression_threshold", 0.8)?
            .set_default("conversation.max_in_context_messages", 50)?
            .set_default("conversation.retain_recent_messages", 16)?
            .set_default("conversation.summary_max_output_tokens", 768)?
            .set_default("conversation.summary_model_agent", ORCHESTRATOR)?
            .add_source(File::from_str(&expanded, FileFormat::Toml))
            .build()?;

        // Options under services.<name>.options are decoded later by the service type
        let unknown: Vec<String> = s
            .clone()
            .try_deserialize::<BTreeMap<String, IgnoredAny>>()?
            .into_keys()
            .filter(|key| !TOP_LEVEL_KEYS.contains(&key.as_str()))
            .collect();
        if let Some(key) = unknown.into_iter().next() {
            return Err(ConfigError::UnknownKey(key));
        }

        let mut settings: Settings = s.try_deserialize()?;
        ConfigValidator::validate(&settings).map_err(ConfigError::Validation)?;

        settings.agents.retain(|name, agent| {
            if !agent.enabled {
                debug!(agent = %name, "Agent disabled");
            }
            agent.enabled
        });
        settings.services.retain(|name, service| {
            if !service.enabled {
                debug!(service = %name, "Service disabled");
            }
            service.enabled
        });

        Ok(settings)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSettings> {
        self.agents.get(name)
    }

    /// Enabled agents with their model parameters
    pub fn agent_models(&self) -> impl Iterator<Item = (&String, &LlmProviderConfig)> {
        self.agents.iter().filter_map(|(name, a)| a.llm.as_ref().map(|llm| (name, llm)))
    }
}

/// Loads the configuration file once and hands out the result
pub struct ConfigLoader {
    path: PathBuf,
    settings: OnceCell<Arc<Settings>>,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            settings: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, parse and validate the file
    ///
    /// Reload is not supported: a second call fails with `AlreadyLoaded`.
    pub fn load(&self) -> Result<Arc<Settings>, ConfigError> {
        if self.settings.get().is_some() {
            return Err(ConfigError::AlreadyLoaded);
        }

        let raw = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.display().to_string(),
            source,
        })?;
        let settings = Arc::new(Settings::from_toml(&raw)?);
        self.settings
            .set(settings.clone())
            .map_err(|_| ConfigError::AlreadyLoaded)?;

        info!(
            path = %self.path.display(),
            agents = settings.agents.len(),
            services = settings.services.len(),
            "Configuration loaded"
        );
        Ok(settings)
    }

    pub fn get(&self) -> Result<Arc<Settings>, ConfigError> {
        self.settings.get().cloned().ok_or(ConfigError::NotLoaded)
    }
}
