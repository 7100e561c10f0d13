//! HTTP plumbing shared by the built-in services

use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

use super::{ServiceError, ServiceResponse};

/// Fixed timeout for health checks
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call timeout when the service options do not set one
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

const BODY_EXCERPT_CHARS: usize = 300;

/// Decoded reply of a remote call
#[derive(Debug, Clone)]
pub struct RemoteReply {
    pub status: StatusCode,
    /// Parsed JSON body; `Null` when the body is empty
    pub body: Value,
    excerpt: String,
}

impl RemoteReply {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Remote-reported failure as a tool response
    ///
    /// Prefers the error text the remote put in its JSON body over the raw excerpt.
    pub fn failure(&self, operation: &str) -> ServiceResponse {
        let detail = remote_detail(&self.body).unwrap_or_else(|| self.excerpt.clone());
        let message = if detail.is_empty() {
            format!("HTTP {}", self.status.as_u16())
        } else {
            format!("HTTP {}: {}", self.status.as_u16(), detail)
        };
        ServiceResponse::failure(operation, message).with("status", self.status.as_u16())
    }
}

/// One `reqwest` client bound to a service's base URL
///
/// `close` drops the client; later calls fail with [`ServiceError::Closed`].
pub struct HttpServiceClient {
    service: String,
    base_url: String,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpServiceClient {
    pub fn new(
        service: impl Into<String>,
        base_url: &str,
        timeout_secs: Option<u64>,
        headers: HeaderMap,
    ) -> Result<Self, ServiceError> {
        let service = service.into();
        if base_url.trim().is_empty() {
            return Err(ServiceError::InvalidOptions {
                service,
                message: "url is required".to_string(),
            });
        }
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS).max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::InvalidOptions {
                service: service.clone(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            service,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: RwLock::new(Some(client)),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Start a request against `path`
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ServiceError> {
        let client = self
            .client
            .read()
            .clone()
            .ok_or_else(|| ServiceError::Closed(self.service.clone()))?;
        Ok(client.request(method, self.url(path)))
    }

    /// Execute a request and decode its body
    ///
    /// Non-2xx statuses are returned as replies, not errors. Connect failures,
    /// timeouts and undecodable 2xx bodies are errors.
    pub async fn send(&self, request: RequestBuilder) -> Result<RemoteReply, ServiceError> {
        let response = request.send().await.map_err(|e| self.transport(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport(e))?;

        if !status.is_success() {
            let body = serde_json::from_str(&text).unwrap_or(Value::Null);
            return Ok(RemoteReply {
                status,
                body,
                excerpt: excerpt(&text),
            });
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| ServiceError::Decode {
                service: self.service.clone(),
                message: e.to_string(),
            })?
        };
        Ok(RemoteReply {
            status,
            body,
            excerpt: String::new(),
        })
    }

    /// GET `path` with query parameters
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<RemoteReply, ServiceError> {
        let request = self.request(Method::GET, path)?.query(query);
        self.send(request).await
    }

    /// GET `path` with the fixed health timeout; any non-2xx status is an error
    pub async fn probe(&self, path: &str) -> Result<(), ServiceError> {
        let request = self.request(Method::GET, path)?.timeout(HEALTH_TIMEOUT);
        let response = request.send().await.map_err(|e| ServiceError::Transport {
            service: self.service.clone(),
            message: format!("health check failed: {}", e),
        })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ServiceError::Transport {
                service: self.service.clone(),
                message: format!("health check failed: HTTP {}", response.status().as_u16()),
            })
        }
    }

    /// Drop the client; idempotent
    pub fn close(&self) {
        self.client.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.client.read().is_none()
    }

    fn transport(&self, err: reqwest::Error) -> ServiceError {
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else {
            err.to_string()
        };
        ServiceError::Transport {
            service: self.service.clone(),
            message,
        }
    }
}

/// `error`, `error.reason`, `error.message` or `message`, whichever is a string
fn remote_detail(body: &Value) -> Option<String> {
    [
        body.get("error"),
        body.pointer("/error/reason"),
        body.pointer("/error/message"),
        body.get("message"),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str())
    .map(str::to_string)
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= BODY_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(BODY_EXCERPT_CHARS).collect();
    format!("{}…", cut)
}
