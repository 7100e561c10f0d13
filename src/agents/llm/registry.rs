//! Model registry: one constructed provider per configured agent name

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{create_provider, LlmProvider};
use crate::agents::config::LlmProviderConfig;
use crate::agents::error::{AgentError, AgentResult};

/// Agent name to model provider
///
/// Written at start-up only. Agents borrow providers from here and never
/// close them; `close_all` does, once.
#[derive(Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<dyn LlmProvider>>,
    closed: AtomicBool,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a provider for every (agent name, llm parameters) pair
    ///
    /// Each agent gets its own provider; parameters are never shared.
    pub fn build<'a>(
        agents: impl IntoIterator<Item = (&'a String, &'a LlmProviderConfig)>,
    ) -> AgentResult<Self> {
        let mut registry = Self::new();
        for (name, llm) in agents {
            let provider = create_provider(llm)
                .map_err(|e| AgentError::Init(format!("model for agent {}: {}", name, e)))?;
            info!(agent = %name, provider = %llm.provider, model = %llm.model, "Model registered");
            registry.insert(name.clone(), provider);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, agent_name: impl Into<String>, model: Arc<dyn LlmProvider>) {
        self.models.insert(agent_name.into(), model);
    }

    pub fn get(&self, agent_name: &str) -> AgentResult<Arc<dyn LlmProvider>> {
        self.models
            .get(agent_name)
            .cloned()
            .ok_or_else(|| AgentError::Configuration(format!("no model registered for agent {}", agent_name)))
    }

    pub fn contains(&self, agent_name: &str) -> bool {
        self.models.contains_key(agent_name)
    }

    pub fn names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Close every model, collecting failures instead of stopping at the first
    ///
    /// Subsequent calls are no-ops.
    pub async fn close_all(&self) -> Vec<String> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Model registry already closed");
            return Vec::new();
        }
        let mut errors = Vec::new();
        for (name, model) in &self.models {
            if let Err(e) = model.close().await {
                warn!(agent = %name, error = %e, "Failed to close model");
                errors.push(format!("model {}: {}", name, e));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::config::LlmProviderType;
    use crate::agents::llm::ScriptedProvider;

    #[test]
    fn test_build_binds_each_agent() {
        let configs: Vec<(String, LlmProviderConfig)> = vec![
            (
                "orchestrator".to_string(),
                LlmProviderConfig::new(LlmProviderType::OpenAI, "gpt-4o").with_api_key("k1"),
            ),
            (
                "report_agent".to_string(),
                LlmProviderConfig::new(LlmProviderType::Anthropic, "claude-3-5-sonnet").with_api_key("k2"),
            ),
        ];
        let registry = ModelRegistry::build(configs.iter().map(|(n, c)| (n, c))).unwrap();
        assert_eq!(registry.get("orchestrator").unwrap().name(), "openai");
        assert_eq!(registry.get("report_agent").unwrap().name(), "anthropic");
        assert!(matches!(registry.get("missing"), Err(AgentError::Configuration(_))));
    }

    #[test]
    fn test_build_failure_names_agent() {
        let configs = vec![(
            "service_agent".to_string(),
            LlmProviderConfig::new(LlmProviderType::Gemini, "").with_api_key("k"),
        )];
        let err = ModelRegistry::build(configs.iter().map(|(n, c)| (n, c)))
            .err()
            .unwrap();
        assert!(err.to_string().contains("service_agent"));
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let mut registry = ModelRegistry::new();
        registry.insert("general_agent", Arc::new(ScriptedProvider::new(Vec::new())));
        assert!(registry.close_all().await.is_empty());
        assert!(registry.close_all().await.is_empty());
    }
}
