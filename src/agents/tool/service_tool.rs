//! Adapter from a typed service handler to a [`Tool`]

use async_trait::async_trait;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{Tool, ToolContext};
use crate::agents::domain::ToolDefinition;
use crate::agents::error::{AgentError, AgentResult};
use crate::services::{ServiceHandler, ServiceResponse};

/// Generate an inline JSON schema for `T`
///
/// Optional fields are plain (no `null` in their type) and never required.
pub fn inline_schema<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|s| {
            s.inline_subschemas = true;
            s.option_add_null_type = false;
            s.meta_schema = None;
        })
        .into_generator();
    let schema = generator.into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}))
}

/// Input schema for a service request with the `operation` discriminator pinned
/// to `operations` and made the only required field
pub fn schema_with_operations<T: JsonSchema>(operations: &[&str]) -> Value {
    let mut schema = inline_schema::<T>();
    if let Some(object) = schema.as_object_mut() {
        let properties = object
            .entry("properties")
            .or_insert_with(|| json!({}));
        if let Some(properties) = properties.as_object_mut() {
            properties.insert(
                "operation".to_string(),
                json!({
                    "type": "string",
                    "enum": operations,
                    "description": "Operation to perform; pass its parameters in the field of the same name",
                }),
            );
        }
        object.insert("required".to_string(), json!(["operation"]));
        object.remove("title");
    }
    schema
}

/// Exposes every operation of a service as a single tool
pub struct ServiceTool<S: ServiceHandler> {
    service: Arc<S>,
    definition: ToolDefinition,
}

impl<S: ServiceHandler> ServiceTool<S> {
    pub fn new(service: Arc<S>) -> Self {
        let description = format!(
            "{} Operations: {}.",
            service.description().trim_end_matches('.'),
            S::OPERATIONS.join(", ")
        );
        let definition = ToolDefinition::new(
            service.name(),
            description,
            schema_with_operations::<S::Request>(S::OPERATIONS),
        )
        .with_output_schema(inline_schema::<ServiceResponse>());

        Self { service, definition }
    }
}

#[async_trait]
impl<S: ServiceHandler> Tool for ServiceTool<S> {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn call(&self, ctx: &ToolContext, input: &str) -> AgentResult<String> {
        let request: S::Request = serde_json::from_str(input).map_err(|e| AgentError::InvalidInput {
            tool: self.definition.name.clone(),
            message: e.to_string(),
        })?;

        debug!(tool = %self.definition.name, call_id = %ctx.call_id(), "Dispatching service request");
        let response = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => return Err(AgentError::Cancelled),
            result = self.service.handle(request) => result
                .map_err(|e| AgentError::ToolExecution(e.to_string()))?,
        };

        Ok(serde_json::to_string(&response)?)
    }
}
