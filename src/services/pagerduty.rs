//! PagerDuty incidents (REST API v2)

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Method;
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

pub const SERVICE_TYPE: &str = "pagerduty";

const DEFAULT_URL: &str = "https://api.pagerduty.com";
const DEFAULT_LIMIT: u32 = 25;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PagerDutyOptions {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    /// Email of the acting user, required by write operations
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PagerDutyRequest {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_incidents: Option<IncidentFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_incident: Option<IncidentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledge: Option<IncidentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve: Option<IncidentRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct IncidentFilter {
    /// Any of `triggered`, `acknowledged`, `resolved` (default: triggered and acknowledged)
    #[serde(default)]
    pub statuses: Vec<String>,
    /// Any of `high`, `low`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    /// Only incidents created after this RFC 3339 time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    /// Maximum incidents to return (default 25)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct IncidentRef {
    /// Incident id, e.g. `P123ABC`
    pub id: String,
}

impl IncidentRef {
    /// API path of the incident; ids are alphanumeric
    fn path(&self, op: &str) -> Result<String, ServiceResponse> {
        if self.id.is_empty() || !self.id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ServiceResponse::failure(op, format!("invalid incident id: {:?}", self.id)));
        }
        Ok(format!("/incidents/{}", self.id))
    }
}

pub struct PagerDutyService {
    spec: ServiceSpec,
    http: HttpServiceClient,
    from_email: Option<String>,
}

impl PagerDutyService {
    pub fn new(spec: ServiceSpec, options: PagerDutyOptions) -> Result<Self, ServiceError> {
        let invalid = |message: String| ServiceError::InvalidOptions {
            service: spec.name.clone(),
            message,
        };
        let api_key = options
            .api_key
            .as_ref()
            .filter(|k| !k.expose_secret().trim().is_empty())
            .ok_or_else(|| invalid("api_key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Token token={}", api_key.expose_secret()))
            .map_err(|e| invalid(format!("invalid api_key: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.pagerduty+json;version=2"));

        let http = HttpServiceClient::new(spec.name.clone(), &options.url, options.timeout, headers)?;
        Ok(Self {
            spec,
            http,
            from_email: options.from_email.filter(|e| !e.trim().is_empty()),
        })
    }

    async fn list_incidents(&self, filter: IncidentFilter) -> Result<ServiceResponse, ServiceError> {
        let op = "list_incidents";
        let statuses = if filter.statuses.is_empty() {
            vec!["triggered".to_string(), "acknowledged".to_string()]
        } else {
            filter.statuses.clone()
        };
        let mut query: Vec<(&str, String)> = statuses.iter().map(|s| ("statuses[]", s.clone())).collect();
        query.push(("limit", filter.limit.unwrap_or(DEFAULT_LIMIT).to_string()));
        query.push(("sort_by", "created_at:desc".to_string()));
        if let Some(urgency) = &filter.urgency {
            query.push(("urgencies[]", urgency.clone()));
        }
        if let Some(since) = &filter.since {
            query.push(("since", since.clone()));
        }

        let reply = self.http.get("/incidents", &query).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }

        let incidents: Vec<Value> = reply.body["incidents"]
            .as_array()
            .into_iter()
            .flatten()
            .map(summarise_incident)
            .collect();
        Ok(ServiceResponse::ok(op, format!("{} incidents", incidents.len()))
            .with("statuses", statuses)
            .with("more", reply.body["more"].as_bool().unwrap_or(false))
            .with("incidents", incidents))
    }

    async fn get_incident(&self, incident: IncidentRef) -> Result<ServiceResponse, ServiceError> {
        let op = "get_incident";
        let path = match incident.path(op) {
            Ok(path) => path,
            Err(response) => return Ok(response),
        };
        let reply = self.http.get(&path, &[]).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }

        let summary = summarise_incident(&reply.body["incident"]);
        Ok(ServiceResponse::ok(op, format!("incident {} is {}", incident.id, summary["status"].as_str().unwrap_or("unknown")))
            .with("incident", summary))
    }

    /// Move an incident to `status`; PagerDuty requires the acting user's email
    async fn update_status(&self, op: &str, incident: IncidentRef, status: &str) -> Result<ServiceResponse, ServiceError> {
        let path = match incident.path(op) {
            Ok(path) => path,
            Err(response) => return Ok(response),
        };
        let Some(from) = self.from_email.as_deref() else {
            return Ok(ServiceResponse::failure(op, "from_email is not configured for this service"));
        };

        let body = json!({"incident": {"type": "incident_reference", "status": status}});
        let request = self
            .http
            .request(Method::PUT, &path)?
            .header("From", from)
            .json(&body);
        let reply = self.http.send(request).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }

        Ok(ServiceResponse::ok(op, format!("incident {} {}", incident.id, status))
            .with("incident", summarise_incident(&reply.body["incident"])))
    }
}

fn summarise_incident(incident: &Value) -> Value {
    json!({
        "id": incident["id"],
        "number": incident["incident_number"],
        "title": incident["title"],
        "status": incident["status"],
        "urgency": incident["urgency"],
        "service": incident["service"]["summary"],
        "created_at": incident["created_at"],
        "url": incident["html_url"],
    })
}

#[async_trait]
impl Service for PagerDutyService {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn service_type(&self) -> &str {
        SERVICE_TYPE
    }

    fn description(&self) -> &str {
        if self.spec.description.is_empty() {
            "PagerDuty incidents: list, inspect, acknowledge and resolve."
        } else {
            &self.spec.description
        }
    }

    async fn health(&self) -> Result<(), ServiceError> {
        self.http.probe("/abilities").await
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
impl ServiceHandler for PagerDutyService {
    type Request = PagerDutyRequest;

    const OPERATIONS: &'static [&'static str] = &["list_incidents", "get_incident", "acknowledge", "resolve"];

    async fn handle(&self, request: PagerDutyRequest) -> Result<ServiceResponse, ServiceError> {
        let op = request.operation.as_str();
        match op {
            "list_incidents" => match require(op, request.list_incidents) {
                Ok(filter) => self.list_incidents(filter).await,
                Err(response) => Ok(response),
            },
            "get_incident" => match require(op, request.get_incident) {
                Ok(incident) => self.get_incident(incident).await,
                Err(response) => Ok(response),
            },
            "acknowledge" => match require(op, request.acknowledge) {
                Ok(incident) => self.update_status(op, incident, "acknowledged").await,
                Err(response) => Ok(response),
            },
            "resolve" => match require(op, request.resolve) {
                Ok(incident) => self.update_status(op, incident, "resolved").await,
                Err(response) => Ok(response),
            },
            other => Ok(ServiceResponse::unknown_operation(other)),
        }
    }
}

pub(crate) fn register(types: &ServiceTypeRegistry) {
    types.register::<PagerDutyOptions, _>(SERVICE_TYPE, |spec, options| {
        Ok(Arc::new(PagerDutyService::new(spec, options)?) as Arc<dyn Service>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tool::ToolContext;
    use crate::services::testing::{assert_reparses, serve};
    use axum::extract::{Path, RawQuery};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use tokio_util::sync::CancellationToken;

    fn incident(id: &str, status: &str) -> Value {
        json!({
            "id": id, "incident_number": 7, "title": "API latency", "status": status,
            "urgency": "high", "service": {"summary": "checkout"},
            "created_at": "2024-01-01T00:00:00Z", "html_url": "https://example.pagerduty.com/incidents/P1"
        })
    }

    async fn mock_pagerduty() -> String {
        let router = Router::new()
            .route(
                "/incidents",
                get(|headers: AxumHeaders, RawQuery(query): RawQuery| async move {
                    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Token token=pd-key") {
                        return (StatusCode::UNAUTHORIZED, Json(json!({"error": {"message": "Invalid token"}})));
                    }
                    let query = query.unwrap_or_default();
                    let mut incidents = vec![incident("P1", "triggered")];
                    if !query.contains("urgencies") {
                        incidents.push(incident("P2", "acknowledged"));
                    }
                    (StatusCode::OK, Json(json!({"incidents": incidents, "more": false, "query": query})))
                }),
            )
            .route(
                "/incidents/:id",
                get(|Path(id): Path<String>| async move {
                    if id == "NOPE" {
                        return (StatusCode::NOT_FOUND, Json(json!({"error": {"message": "Not Found", "code": 2100}})));
                    }
                    (StatusCode::OK, Json(json!({"incident": incident(&id, "triggered")})))
                })
                .put(|Path(id): Path<String>, headers: AxumHeaders, Json(body): Json<Value>| async move {
                    if headers.get("from").is_none() {
                        return (StatusCode::BAD_REQUEST, Json(json!({"error": {"message": "From header missing"}})));
                    }
                    let status = body["incident"]["status"].as_str().unwrap_or_default().to_string();
                    (StatusCode::OK, Json(json!({"incident": incident(&id, &status)})))
                }),
            );
        serve(router).await
    }

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "pagerduty".to_string(),
            service_type: SERVICE_TYPE.to_string(),
            description: String::new(),
        }
    }

    async fn service(api_key: &str, from_email: Option<&str>) -> Arc<PagerDutyService> {
        let options = PagerDutyOptions {
            url: mock_pagerduty().await,
            api_key: Some(SecretString::from(api_key.to_string())),
            from_email: from_email.map(str::to_string),
            timeout: Some(5),
        };
        Arc::new(PagerDutyService::new(spec(), options).unwrap())
    }

    async fn call(service: &Arc<PagerDutyService>, input: Value) -> Value {
        let tool = service.clone().as_tool();
        let ctx = ToolContext::new("call_1", CancellationToken::new(), None);
        let output = tool.call(&ctx, &input.to_string()).await.unwrap();
        serde_json::from_str(&output).unwrap()
    }

    #[tokio::test]
    async fn test_list_incidents_defaults_to_open() {
        let service = service("pd-key", None).await;
        let response = call(&service, json!({"operation": "list_incidents", "list_incidents": {}})).await;

        assert_eq!(response["success"], true);
        assert_eq!(response["message"], "2 incidents");
        assert_eq!(response["statuses"], json!(["triggered", "acknowledged"]));
        assert_eq!(response["incidents"][0]["service"], "checkout");
    }

    #[tokio::test]
    async fn test_missing_sub_object() {
        let service = service("pd-key", None).await;
        let response = call(&service, json!({"operation": "list_incidents"})).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["message"], "missing list_incidents params");
    }

    #[tokio::test]
    async fn test_bad_token_is_remote_failure() {
        let service = service("wrong", None).await;
        let response = call(&service, json!({"operation": "list_incidents", "list_incidents": {"urgency": "high"}})).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["message"], "HTTP 401: Invalid token");
    }

    #[tokio::test]
    async fn test_get_incident() {
        let service = service("pd-key", None).await;
        let response = call(&service, json!({"operation": "get_incident", "get_incident": {"id": "P9"}})).await;
        assert_eq!(response["message"], "incident P9 is triggered");

        let response = call(&service, json!({"operation": "get_incident", "get_incident": {"id": "NOPE"}})).await;
        assert_eq!(response["message"], "HTTP 404: Not Found");
    }

    #[tokio::test]
    async fn test_incident_id_must_be_alphanumeric() {
        let service = service("pd-key", Some("oncall@example.com")).await;
        let response = call(&service, json!({"operation": "get_incident", "get_incident": {"id": "P9/../../users"}})).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["message"], r#"invalid incident id: "P9/../../users""#);

        let response = call(&service, json!({"operation": "resolve", "resolve": {"id": "P1?status=x"}})).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["operation"], "resolve");

        let response = call(&service, json!({"operation": "acknowledge", "acknowledge": {"id": ""}})).await;
        assert_eq!(response["message"], r#"invalid incident id: """#);
    }

    #[tokio::test]
    async fn test_acknowledge_and_resolve_need_from_email() {
        let service_without = service("pd-key", None).await;
        let response = call(&service_without, json!({"operation": "acknowledge", "acknowledge": {"id": "P1"}})).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["message"], "from_email is not configured for this service");

        let service = service("pd-key", Some("oncall@example.com")).await;
        let response = call(&service, json!({"operation": "acknowledge", "acknowledge": {"id": "P1"}})).await;
        assert_eq!(response["success"], true);
        assert_eq!(response["message"], "incident P1 acknowledged");
        assert_eq!(response["incident"]["status"], "acknowledged");

        let response = call(&service, json!({"operation": "resolve", "resolve": {"id": "P1"}})).await;
        assert_eq!(response["incident"]["status"], "resolved");
    }

    #[test]
    fn test_api_key_required() {
        let options = PagerDutyOptions {
            url: default_url(),
            api_key: Some(SecretString::from("  ".to_string())),
            from_email: None,
            timeout: None,
        };
        let err = PagerDutyService::new(spec(), options).err().unwrap();
        assert_eq!(err.to_string(), "invalid options for service pagerduty: api_key is required");
    }

    #[test]
    fn test_request_reparses() {
        let value = assert_reparses::<PagerDutyRequest>(
            r#"{"operation":"list_incidents","list_incidents":{"statuses":["triggered"],"urgency":"high","limit":5}}"#,
        );
        assert!(value["list_incidents"].get("since").is_none());
        assert!(value.get("get_incident").is_none());

        let value = assert_reparses::<PagerDutyRequest>(r#"{"operation":"list_incidents","list_incidents":{}}"#);
        assert_eq!(value["list_incidents"], serde_json::json!({"statuses": []}));

        let value = assert_reparses::<PagerDutyRequest>(r#"{"operation":"resolve","resolve":{"id":"P1"}}"#);
        assert_eq!(value["resolve"]["id"], "P1");
        assert!(value.get("acknowledge").is_none());
    }
}
