//! Error types for the agent runtime

use thiserror::Error;

/// Errors that can occur while running agents
#[derive(Debug, Error)]
pub enum AgentError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A service or model failed to construct
    #[error("Initialization error: {0}")]
    Init(String),

    /// A tool was invoked with input that does not match its schema
    #[error("Invalid tool input for '{tool}': {message}")]
    InvalidInput { tool: String, message: String },

    /// A tool handler itself failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// LLM provider error
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Routing chose a child that does not exist
    #[error("Target agent not found: {0}")]
    TargetNotFound(String),

    /// The request context was cancelled
    #[error("Operation was cancelled")]
    Cancelled,

    /// Session bookkeeping failed (including summarisation)
    #[error("Session error: {0}")]
    Session(String),

    /// Save/load of a session document failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Max tool rounds reached
    #[error("Max iterations ({0}) reached without completion")]
    MaxIterations(u32),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// True when the error is a cooperative cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

/// Errors specific to LLM provider operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider not found
    #[error("LLM provider not found: {0}")]
    ProviderNotFound(String),

    /// API error
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Rate limited
    #[error("Rate limited{}", .retry_after_ms.map(|ms| format!(": retry after {}ms", ms)).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    /// Authentication error
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Streaming(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Content filtered
    #[error("Content filtered by safety system")]
    ContentFiltered,

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Timeout
    #[error("Request timed out")]
    Timeout,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_connect() {
            LlmError::Network(format!("Connection error: {}", err))
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Persistence(format!("IO error: {}", err))
    }
}

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Result type alias for LLM operations
pub type LlmResult<T> = Result<T, LlmError>;
