//! Per-agent LLM provider configuration

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::env;

/// Default model call timeout in seconds
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;
/// Default completion limit applied when the model is built
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
/// Default sampling temperature applied when the model is built
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

/// LLM provider configuration for one agent
///
/// Parameters are strict per agent: nothing is inherited from another agent.
#[derive(Debug, Deserialize)]
pub struct LlmProviderConfig {
    /// Provider type
    pub provider: LlmProviderType,
    /// Model name/identifier
    #[serde(default)]
    pub model: String,
    /// API key; blank falls back to the provider's environment variable
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    /// Custom base URL (for self-hosted or proxied endpoints)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

pub(crate) fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(SecretString::from))
}

impl Clone for LlmProviderConfig {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider,
            model: self.model.clone(),
            api_key: self
                .api_key
                .as_ref()
                .map(|k| SecretString::from(k.expose_secret().to_string())),
            base_url: self.base_url.clone(),
            timeout: self.timeout,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

impl LlmProviderConfig {
    pub fn new(provider: LlmProviderType, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            api_key: None,
            base_url: None,
            timeout: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Configured key, or the provider's environment variable when blank
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        if let Some(key) = &self.api_key {
            if !key.expose_secret().trim().is_empty() {
                return Some(SecretString::from(key.expose_secret().to_string()));
            }
        }
        self.provider
            .api_key_env_vars()
            .iter()
            .filter_map(|var| env::var(var).ok())
            .find(|value| !value.trim().is_empty())
            .map(SecretString::from)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_LLM_TIMEOUT_SECS)
    }

    pub fn max_tokens_or_default(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn temperature_or_default(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderType {
    /// OpenAI (GPT-4o and compatible endpoints)
    #[default]
    OpenAI,
    /// Anthropic (Claude)
    Anthropic,
    /// Google Gemini
    #[serde(alias = "google")]
    Gemini,
}

impl LlmProviderType {
    /// Environment variables consulted, in order, when the configured key is blank
    pub fn api_key_env_vars(&self) -> &'static [&'static str] {
        match self {
            LlmProviderType::OpenAI => &["OPENAI_API_KEY"],
            LlmProviderType::Anthropic => &["ANTHROPIC_API_KEY"],
            LlmProviderType::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        }
    }
}

impl std::fmt::Display for LlmProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProviderType::OpenAI => write!(f, "openai"),
            LlmProviderType::Anthropic => write!(f, "anthropic"),
            LlmProviderType::Gemini => write!(f, "gemini"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provider_aliases() {
        let json = r#"{"provider": "google", "model": "gemini-1.5-pro"}"#;
        let config: LlmProviderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.provider, LlmProviderType::Gemini);
        assert_eq!(config.timeout_secs(), 60);
        assert_eq!(config.max_tokens_or_default(), 4096);
        assert!((config.temperature_or_default() - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_explicit_key_wins() {
        let config = LlmProviderConfig::new(LlmProviderType::OpenAI, "gpt-4o").with_api_key("sk-test");
        let key = config.resolve_api_key().unwrap();
        assert_eq!(key.expose_secret(), "sk-test");
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let config = LlmProviderConfig::new(LlmProviderType::Anthropic, "claude").with_api_key("sk-secret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let json = r#"{"provider": "ollama", "model": "llama3"}"#;
        assert!(serde_json::from_str::<LlmProviderConfig>(json).is_err());
    }
}
