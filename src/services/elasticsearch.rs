//! Elasticsearch log search

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::{
    require, HttpServiceClient, Service, ServiceError, ServiceHandler, ServiceResponse, ServiceSpec,
    ServiceTypeRegistry,
};
use crate::agents::config::deserialize_secret;
use crate::agents::tool::{ServiceTool, Tool};

pub const SERVICE_TYPE: &str = "elasticsearch";

const DEFAULT_SIZE: u32 = 20;
const MAX_SIZE: u32 = 200;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElasticsearchOptions {
    pub url: String,
    /// Index pattern used when a request names none
    #[serde(default = "default_index")]
    pub default_index: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_index() -> String {
    "logs-*".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ElasticsearchRequest {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<CountParams>,
}

/// Full-text log search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SearchParams {
    /// Lucene query string, e.g. `level:error AND service:checkout`
    pub query: String,
    /// Index pattern (defaults to the configured index)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Lower bound on `@timestamp`, e.g. `now-1h` (default `now-1h`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    /// Number of hits to return (default 20, max 200)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

/// Count matching log lines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CountParams {
    /// Lucene query string
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Lower bound on `@timestamp` (default `now-1h`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

pub struct ElasticsearchService {
    spec: ServiceSpec,
    http: HttpServiceClient,
    credentials: Option<Credentials>,
    default_index: String,
}

impl ElasticsearchService {
    pub fn new(spec: ServiceSpec, options: ElasticsearchOptions) -> Result<Self, ServiceError> {
        let http = HttpServiceClient::new(spec.name.clone(), &options.url, options.timeout, HeaderMap::new())?;
        Ok(Self {
            spec,
            http,
            credentials: Credentials::from_options(&options),
            default_index: options.default_index,
        })
    }

    /// Start an authenticated request
    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ServiceError> {
        let request = self.http.request(method, path)?;
        match &self.credentials {
            Some(credentials) => credentials.apply(request),
            None => Ok(request),
        }
    }

    fn query_body(query: &str, since: Option<&str>) -> Value {
        json!({
            "bool": {
                "must": [{"query_string": {"query": query}}],
                "filter": [{"range": {"@timestamp": {"gte": since.unwrap_or("now-1h")}}}]
            }
        })
    }

    async fn search(&self, params: SearchParams) -> Result<ServiceResponse, ServiceError> {
        let op = "search";
        let index = params.index.as_deref().unwrap_or(&self.default_index);
        let size = params.size.unwrap_or(DEFAULT_SIZE).min(MAX_SIZE);
        let body = json!({
            "query": Self::query_body(&params.query, params.since.as_deref()),
            "size": size,
            "sort": [{"@timestamp": {"order": "desc"}}],
        });

        let request = self.request(Method::POST, &format!("/{}/_search", index))?.json(&body);
        let reply = self.http.send(request).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }

        let hits = &reply.body["hits"];
        let total = hits["total"]["value"].as_u64().or_else(|| hits["total"].as_u64()).unwrap_or(0);
        let documents: Vec<Value> = hits["hits"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|hit| {
                json!({
                    "index": hit["_index"],
                    "id": hit["_id"],
                    "source": hit["_source"],
                })
            })
            .collect();

        Ok(ServiceResponse::ok(op, format!("{} hits, showing {}", total, documents.len()))
            .with("index", index)
            .with("total", total)
            .with("hits", documents))
    }

    async fn count(&self, params: CountParams) -> Result<ServiceResponse, ServiceError> {
        let op = "count";
        let index = params.index.as_deref().unwrap_or(&self.default_index);
        let body = json!({"query": Self::query_body(&params.query, params.since.as_deref())});

        let request = self.request(Method::POST, &format!("/{}/_count", index))?.json(&body);
        let reply = self.http.send(request).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }

        let count = reply.body["count"].as_u64().unwrap_or(0);
        Ok(ServiceResponse::ok(op, format!("{} documents", count))
            .with("index", index)
            .with("count", count))
    }
}

enum Credentials {
    Basic { username: String, password: Option<SecretString> },
    ApiKey(SecretString),
}

impl Credentials {
    fn from_options(options: &ElasticsearchOptions) -> Option<Self> {
        if let Some(key) = &options.api_key {
            return Some(Self::ApiKey(SecretString::from(key.expose_secret().to_string())));
        }
        options.username.as_ref().map(|username| Self::Basic {
            username: username.clone(),
            password: options
                .password
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_string())),
        })
    }

    fn apply(&self, request: RequestBuilder) -> Result<RequestBuilder, ServiceError> {
        match self {
            Self::Basic { username, password } => {
                Ok(request.basic_auth(username, password.as_ref().map(|p| p.expose_secret().to_string())))
            }
            Self::ApiKey(key) => {
                let mut value = HeaderValue::from_str(&format!("ApiKey {}", key.expose_secret())).map_err(|e| {
                    ServiceError::InvalidOptions {
                        service: SERVICE_TYPE.to_string(),
                        message: format!("invalid api_key: {}", e),
                    }
                })?;
                value.set_sensitive(true);
                Ok(request.header(AUTHORIZATION, value))
            }
        }
    }
}

#[async_trait]
impl Service for ElasticsearchService {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn service_type(&self) -> &str {
        SERVICE_TYPE
    }

    fn description(&self) -> &str {
        if self.spec.description.is_empty() {
            "Elasticsearch log search: query-string search and counts over recent logs."
        } else {
            &self.spec.description
        }
    }

    async fn health(&self) -> Result<(), ServiceError> {
        self.http.probe("/_cluster/health").await
    }

    async fn close(&self) -> Result<(), ServiceError> {
        self.http.close();
        Ok(())
    }

    fn as_tool(self: Arc<Self>) -> Arc<dyn Tool> {
        Arc::new(ServiceTool::new(self))
    }
}

#[async_trait]
impl ServiceHandler for ElasticsearchService {
    type Request = ElasticsearchRequest;

    const OPERATIONS: &'static [&'static str] = &["search", "count"];

    async fn handle(&self, request: ElasticsearchRequest) -> Result<ServiceResponse, ServiceError> {
        let op = request.operation.as_str();
        match op {
            "search" => match require(op, request.search) {
                Ok(params) => self.search(params).await,
                Err(response) => Ok(response),
            },
            "count" => match require(op, request.count) {
                Ok(params) => self.count(params).await,
                Err(response) => Ok(response),
            },
            other => Ok(ServiceResponse::unknown_operation(other)),
        }
    }
}

pub(crate) fn register(types: &ServiceTypeRegistry) {
    types.register::<ElasticsearchOptions, _>(SERVICE_TYPE, |spec, options| {
        Ok(Arc::new(ElasticsearchService::new(spec, options)?) as Arc<dyn Service>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{assert_reparses, serve};
    use axum::extract::Path;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    async fn mock_elasticsearch() -> String {
        let router = Router::new()
            .route("/_cluster/health", get(|| async { Json(json!({"status": "green"})) }))
            .route(
                "/:index/_search",
                post(|Path(index): Path<String>, headers: AxumHeaders, Json(body): Json<Value>| async move {
                    if index == "missing-*" {
                        return (
                            StatusCode::NOT_FOUND,
                            Json(json!({"error": {"type": "index_not_found_exception", "reason": "no such index [missing-*]"}, "status": 404})),
                        );
                    }
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    (
                        StatusCode::OK,
                        Json(json!({
                            "hits": {
                                "total": {"value": 42, "relation": "eq"},
                                "hits": [
                                    {"_index": index, "_id": "1", "_source": {"message": "timeout calling db", "auth": auth, "size": body["size"]}}
                                ]
                            }
                        })),
                    )
                }),
            )
            .route(
                "/:index/_count",
                post(|Json(body): Json<Value>| async move {
                    let query = body["query"]["bool"]["must"][0]["query_string"]["query"].clone();
                    Json(json!({"count": 7, "echo": query}))
                }),
            );
        serve(router).await
    }

    fn options(url: String) -> ElasticsearchOptions {
        ElasticsearchOptions {
            url,
            default_index: default_index(),
            username: Some("elastic".to_string()),
            password: Some(SecretString::from("changeme".to_string())),
            api_key: None,
            timeout: Some(5),
        }
    }

    async fn service() -> ElasticsearchService {
        let spec = ServiceSpec {
            name: "logs".to_string(),
            service_type: SERVICE_TYPE.to_string(),
            description: String::new(),
        };
        ElasticsearchService::new(spec, options(mock_elasticsearch().await)).unwrap()
    }

    fn request(value: Value) -> ElasticsearchRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_search_uses_default_index_and_basic_auth() {
        let service = service().await;
        let response = service
            .handle(request(json!({"operation": "search", "search": {"query": "level:error", "size": 500}})))
            .await
            .unwrap();

        assert!(response.success, "{}", response.message);
        assert_eq!(response.message, "42 hits, showing 1");
        assert_eq!(response.payload["index"], "logs-*");
        let source = &response.payload["hits"][0]["source"];
        assert_eq!(source["auth"], "Basic ZWxhc3RpYzpjaGFuZ2VtZQ==");
        assert_eq!(source["size"], 200);
    }

    #[tokio::test]
    async fn test_missing_index_is_remote_failure() {
        let service = service().await;
        let response = service
            .handle(request(json!({"operation": "search", "search": {"query": "*", "index": "missing-*"}})))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.message, "HTTP 404: no such index [missing-*]");
    }

    #[tokio::test]
    async fn test_count() {
        let service = service().await;
        let response = service
            .handle(request(json!({"operation": "count", "count": {"query": "service:checkout"}})))
            .await
            .unwrap();
        assert_eq!(response.message, "7 documents");
        assert_eq!(response.payload["count"], 7);

        service.health().await.unwrap();
    }

    #[test]
    fn test_api_key_wins_over_basic() {
        let mut opts = options("http://localhost:9200".to_string());
        assert!(matches!(Credentials::from_options(&opts), Some(Credentials::Basic { .. })));
        opts.api_key = Some(SecretString::from("abc".to_string()));
        assert!(matches!(Credentials::from_options(&opts), Some(Credentials::ApiKey(_))));
        opts.api_key = None;
        opts.username = None;
        assert!(Credentials::from_options(&opts).is_none());
    }

    #[test]
    fn test_request_reparses() {
        let value = assert_reparses::<ElasticsearchRequest>(
            r#"{"operation":"search","search":{"query":"level:error","index":"logs-*","since":"now-15m","size":5}}"#,
        );
        assert_eq!(value["search"]["size"], 5);
        assert!(value.get("count").is_none());

        let value = assert_reparses::<ElasticsearchRequest>(r#"{"operation":"count","count":{"query":"*"}}"#);
        assert!(value["count"].get("index").is_none());
        assert!(value["count"].get("since").is_none());
    }
}
