use thiserror::Error;

use crate::config::{AgentSettings, ConversationSettings, LogSettings, ServerSettings, Settings, AGENT_NAMES, ORCHESTRATOR};
use crate::services::ServiceConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Cross-reference error: {0}")]
    CrossReference(String),
}

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["text", "json"];

pub struct ConfigValidator;

impl ConfigValidator {
    /// Structural checks first, then cross-field checks; all errors are collected
    pub fn validate(settings: &Settings) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        Self::validate_server(&settings.server, &mut errors);
        Self::validate_log(&settings.log, &mut errors);
        Self::validate_conversation(&settings.conversation, &mut errors);
        for (name, agent) in &settings.agents {
            Self::validate_agent(name, agent, &mut errors);
        }
        for (name, service) in &settings.services {
            Self::validate_service(name, service, &mut errors);
        }

        Self::validate_cross_references(settings, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_server(server: &ServerSettings, errors: &mut Vec<ValidationError>) {
        if server.addr.trim().is_empty() {
            errors.push(ValidationError::MissingField("server.addr".to_string()));
            return;
        }
        if let Err(reason) = parse_host_port(&server.addr) {
            errors.push(ValidationError::InvalidValue {
                field: "server.addr".to_string(),
                reason,
            });
        }
    }

    fn validate_log(log: &LogSettings, errors: &mut Vec<ValidationError>) {
        if !LOG_LEVELS.contains(&log.level.as_str()) {
            errors.push(ValidationError::InvalidValue {
                field: "log.level".to_string(),
                reason: format!("'{}' is not one of {}", log.level, LOG_LEVELS.join(", ")),
            });
        }
        if !LOG_FORMATS.contains(&log.format.as_str()) {
            errors.push(ValidationError::InvalidValue {
                field: "log.format".to_string(),
                reason: format!("'{}' is not one of {}", log.format, LOG_FORMATS.join(", ")),
            });
        }
        if log.output.trim().is_empty() {
            errors.push(ValidationError::MissingField("log.output".to_string()));
        }
    }

    fn validate_conversation(conversation: &ConversationSettings, errors: &mut Vec<ValidationError>) {
        if conversation.context_window_tokens == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "conversation.context_window_tokens".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        let threshold = conversation.compression_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            errors.push(ValidationError::InvalidValue {
                field: "conversation.compression_threshold".to_string(),
                reason: format!("{} is not in (0, 1]", threshold),
            });
        }
        if conversation.max_in_context_messages == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "conversation.max_in_context_messages".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if conversation.summary_max_output_tokens == 0 {
            errors.push(ValidationError::InvalidValue {
                field: "conversation.summary_max_output_tokens".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if conversation.summary_model_agent.trim().is_empty() {
            errors.push(ValidationError::MissingField("conversation.summary_model_agent".to_string()));
        }
    }

    fn validate_agent(name: &str, agent: &AgentSettings, errors: &mut Vec<ValidationError>) {
        if !AGENT_NAMES.contains(&name) {
            errors.push(ValidationError::InvalidValue {
                field: format!("agents.{}", name),
                reason: format!("unknown agent; expected one of {}", AGENT_NAMES.join(", ")),
            });
        }
        if !agent.enabled {
            return;
        }

        let Some(llm) = &agent.llm else {
            errors.push(ValidationError::MissingField(format!("agents.{}.llm", name)));
            return;
        };
        if llm.model.trim().is_empty() {
            errors.push(ValidationError::MissingField(format!("agents.{}.llm.model", name)));
        }
        if let Some(temperature) = llm.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                errors.push(ValidationError::InvalidValue {
                    field: format!("agents.{}.llm.temperature", name),
                    reason: format!("{} is not in [0, 2]", temperature),
                });
            }
        }
        if llm.max_tokens == Some(0) {
            errors.push(ValidationError::InvalidValue {
                field: format!("agents.{}.llm.max_tokens", name),
                reason: "must be greater than 0".to_string(),
            });
        }
        if llm.timeout == Some(0) {
            errors.push(ValidationError::InvalidValue {
                field: format!("agents.{}.llm.timeout", name),
                reason: "must be greater than 0".to_string(),
            });
        }
        if let Some(url) = &llm.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(ValidationError::InvalidValue {
                    field: format!("agents.{}.llm.base_url", name),
                    reason: "must start with http:// or https://".to_string(),
                });
            }
        }
    }

    fn validate_service(name: &str, service: &ServiceConfig, errors: &mut Vec<ValidationError>) {
        if service.enabled && service.service_type.trim().is_empty() {
            errors.push(ValidationError::MissingField(format!("services.{}.type", name)));
        }
        if !service.options.is_null() && !service.options.is_object() {
            errors.push(ValidationError::InvalidValue {
                field: format!("services.{}.options", name),
                reason: "must be a table".to_string(),
            });
        }
    }

    fn validate_cross_references(settings: &Settings, errors: &mut Vec<ValidationError>) {
        let conversation = &settings.conversation;
        if conversation.retain_recent_messages >= conversation.max_in_context_messages {
            errors.push(ValidationError::CrossReference(format!(
                "conversation.retain_recent_messages ({}) must be less than conversation.max_in_context_messages ({})",
                conversation.retain_recent_messages, conversation.max_in_context_messages
            )));
        }

        let enabled = |name: &str| settings.agents.get(name).is_some_and(|a| a.enabled);
        if !enabled(ORCHESTRATOR) {
            errors.push(ValidationError::CrossReference(format!(
                "agent '{}' must be configured and enabled",
                ORCHESTRATOR
            )));
        }
        if !settings.agents.iter().any(|(name, a)| name != ORCHESTRATOR && a.enabled) {
            errors.push(ValidationError::CrossReference(format!(
                "at least one agent besides '{}' must be enabled",
                ORCHESTRATOR
            )));
        }

        let summary_agent = conversation.summary_model_agent.as_str();
        if !summary_agent.is_empty() && !enabled(summary_agent) {
            errors.push(ValidationError::CrossReference(format!(
                "conversation.summary_model_agent '{}' is not an enabled agent",
                summary_agent
            )));
        }
    }
}

/// Check `host:port`, where host may be a bracketed IPv6 address
fn parse_host_port(addr: &str) -> Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' is not host:port", addr))?;
    if host.is_empty() {
        return Err(format!("'{}' has no host", addr));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(format!("'{}' has an unbracketed IPv6 host", addr));
    }
    port.parse::<u16>()
        .map(|_| ())
        .map_err(|_| format!("'{}' has an invalid port", addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port() {
        assert!(parse_host_port("127.0.0.1:8080").is_ok());
        assert!(parse_host_port("localhost:0").is_ok());
        assert!(parse_host_port("[::1]:8080").is_ok());
        assert!(parse_host_port("localhost").is_err());
        assert!(parse_host_port(":8080").is_err());
        assert!(parse_host_port("localhost:http").is_err());
        assert!(parse_host_port("localhost:70000").is_err());
        assert!(parse_host_port("::1:8080").is_err());
    }
}
