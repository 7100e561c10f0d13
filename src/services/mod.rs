//! Service plugins
//!
//! A service is a typed client for one external system. It exposes its
//! operations to the model as a single tool whose input carries an
//! `operation` discriminator and one optional parameter object per operation.
//!
//! Remote failures are data (`success: false`); only protocol-level failures
//! are errors.

pub mod alertmanager;
pub mod elasticsearch;
mod http;
pub mod pagerduty;
pub mod prometheus;
mod registry;

pub use http::{HttpServiceClient, RemoteReply, HEALTH_TIMEOUT};
pub use registry::{
    register_builtin_services, service_types, ServiceRegistry, ServiceSpec, ServiceTypeRegistry,
};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::agents::tool::Tool;

/// Errors raised by services and their registries
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid options for service {service}: {message}")]
    InvalidOptions { service: String, message: String },

    /// Connect, timeout or unreadable body
    #[error("{service}: {message}")]
    Transport { service: String, message: String },

    #[error("{service}: failed to decode response: {message}")]
    Decode { service: String, message: String },

    #[error("service {0} is closed")]
    Closed(String),

    #[error("no parser registered for service type {0}")]
    NoParser(String),

    #[error("no factory registered for service type {0}")]
    NoFactory(String),

    #[error("service not found: {0}")]
    NotFound(String),
}

/// Raw service wiring from configuration
///
/// `options` stays opaque until the type's parser decodes it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(rename = "type", default)]
    pub service_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub options: Value,
}

fn default_enabled() -> bool {
    true
}

/// Structured result of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceResponse {
    pub operation: String,
    pub success: bool,
    pub message: String,
    /// Operation-specific fields, flattened into the top level
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ServiceResponse {
    pub fn ok(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            success: true,
            message: message.into(),
            payload: Map::new(),
        }
    }

    pub fn failure(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            success: false,
            message: message.into(),
            payload: Map::new(),
        }
    }

    pub fn unknown_operation(operation: &str) -> Self {
        Self::failure(operation, format!("unknown operation: {}", operation))
    }

    pub fn missing_params(operation: &str) -> Self {
        Self::failure(operation, format!("missing {} params", operation))
    }

    /// Attach a payload field
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.payload.insert(key.to_string(), value);
        self
    }
}

/// Object-safe face of a service, as held by the registry
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Type tag the service was registered under
    fn service_type(&self) -> &str;

    fn description(&self) -> &str;

    /// Cheap reachability check with a short fixed timeout
    async fn health(&self) -> Result<(), ServiceError>;

    /// Release the client; idempotent and non-blocking
    async fn close(&self) -> Result<(), ServiceError>;

    /// The single tool exposing every operation
    fn as_tool(self: Arc<Self>) -> Arc<dyn Tool>;
}

/// Typed request handling, reflected into the tool schema
#[async_trait]
pub trait ServiceHandler: Service + 'static {
    /// `operation` plus one optional parameter object per operation
    type Request: DeserializeOwned + JsonSchema + Send + 'static;

    /// Operation names, in the order advertised to the model
    const OPERATIONS: &'static [&'static str];

    async fn handle(&self, request: Self::Request) -> Result<ServiceResponse, ServiceError>;
}

/// Shorthand for handlers: the params for `operation`, or the standard failure
pub(crate) fn require<T>(operation: &str, params: Option<T>) -> Result<T, ServiceResponse> {
    params.ok_or_else(|| ServiceResponse::missing_params(operation))
}
