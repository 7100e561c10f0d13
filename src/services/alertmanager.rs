//! Alertmanager (v2 API)

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    require, HttpServiceClient, Service, ServiceError, ServiceHandler, ServiceResponse, ServiceSpec,
    ServiceTypeRegistry,
};
use crate::agents::tool::{ServiceTool, Tool};

pub const SERVICE_TYPE: &str = "alertmanager";

const MAX_ALERTS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertmanagerOptions {
    pub url: String,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AlertmanagerRequest {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_alerts: Option<AlertFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_silences: Option<SilenceFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AlertFilter {
    /// Label matchers such as `severity="critical"` or `alertname=~"Disk.*"`
    #[serde(default)]
    pub filter: Vec<String>,
    /// Include silenced alerts (default false)
    #[serde(default)]
    pub silenced: bool,
    /// Include inhibited alerts (default false)
    #[serde(default)]
    pub inhibited: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SilenceFilter {
    /// `active`, `pending` or `expired`; all states when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

pub struct AlertmanagerService {
    spec: ServiceSpec,
    http: HttpServiceClient,
}

impl AlertmanagerService {
    pub fn new(spec: ServiceSpec, options: AlertmanagerOptions) -> Result<Self, ServiceError> {
        let http = HttpServiceClient::new(spec.name.clone(), &options.url, options.timeout, HeaderMap::new())?;
        Ok(Self { spec, http })
    }

    async fn list_alerts(&self, filter: AlertFilter) -> Result<ServiceResponse, ServiceError> {
        let op = "list_alerts";
        let mut query = vec![
            ("active", "true".to_string()),
            ("silenced", filter.silenced.to_string()),
            ("inhibited", filter.inhibited.to_string()),
        ];
        query.extend(filter.filter.iter().map(|m| ("filter", m.clone())));

        let reply = self.http.get("/api/v2/alerts", &query).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }

        let alerts: Vec<Value> = reply.body.as_array().cloned().unwrap_or_default();
        let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
        for alert in &alerts {
            let severity = alert["labels"]["severity"].as_str().unwrap_or("none");
            *by_severity.entry(severity.to_string()).or_default() += 1;
        }
        let summarised: Vec<Value> = alerts
            .iter()
            .take(MAX_ALERTS)
            .map(|alert| {
                let labels = &alert["labels"];
                json!({
                    "alertname": labels["alertname"],
                    "severity": labels["severity"].as_str().unwrap_or("none"),
                    "state": alert["status"]["state"],
                    "starts_at": alert["startsAt"],
                    "summary": alert["annotations"]["summary"],
                    "labels": labels,
                })
            })
            .collect();

        let mut response = ServiceResponse::ok(op, format!("{} firing alerts", alerts.len()))
            .with("by_severity", &by_severity)
            .with("alerts", summarised);
        if alerts.len() > MAX_ALERTS {
            response = response.with("truncated", true);
        }
        Ok(response)
    }

    async fn list_silences(&self, filter: SilenceFilter) -> Result<ServiceResponse, ServiceError> {
        let op = "list_silences";
        let reply = self.http.get("/api/v2/silences", &[]).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }

        let silences: Vec<Value> = reply
            .body
            .as_array()
            .into_iter()
            .flatten()
            .filter(|s| {
                filter
                    .state
                    .as_deref()
                    .map_or(true, |wanted| s["status"]["state"].as_str() == Some(wanted))
            })
            .map(|s| {
                json!({
                    "id": s["id"],
                    "state": s["status"]["state"],
                    "matchers": s["matchers"],
                    "created_by": s["createdBy"],
                    "comment": s["comment"],
                    "ends_at": s["endsAt"],
                })
            })
            .collect();

        Ok(ServiceResponse::ok(op, format!("{} silences", silences.len())).with("silences", silences))
    }
}

#[async_trait]
impl Service for AlertmanagerService {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn service_type(&self) -> &str {
        SERVICE_TYPE
    }

    fn description(&self) -> &str {
        if self.spec.description.is_empty() {
            "Alertmanager: currently firing alerts and silences."
        } else {
            &self.spec.description
        }
    }

    async fn health(&self) -> Result<(), ServiceError> {
        self.http.probe("/-/healthy").await
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
impl ServiceHandler for AlertmanagerService {
    type Request = AlertmanagerRequest;

    const OPERATIONS: &'static [&'static str] = &["list_alerts", "list_silences"];

    async fn handle(&self, request: AlertmanagerRequest) -> Result<ServiceResponse, ServiceError> {
        let op = request.operation.as_str();
        match op {
            "list_alerts" => match require(op, request.list_alerts) {
                Ok(filter) => self.list_alerts(filter).await,
                Err(response) => Ok(response),
            },
            "list_silences" => match require(op, request.list_silences) {
                Ok(filter) => self.list_silences(filter).await,
                Err(response) => Ok(response),
            },
            other => Ok(ServiceResponse::unknown_operation(other)),
        }
    }
}

pub(crate) fn register(types: &ServiceTypeRegistry) {
    types.register::<AlertmanagerOptions, _>(SERVICE_TYPE, |spec, options| {
        Ok(Arc::new(AlertmanagerService::new(spec, options)?) as Arc<dyn Service>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{assert_reparses, serve};
    use axum::extract::RawQuery;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn mock_alertmanager() -> String {
        let router = Router::new()
            .route(
                "/api/v2/alerts",
                get(|RawQuery(query): RawQuery| async move {
                    let query = query.unwrap_or_default();
                    let mut alerts = vec![
                        json!({"labels": {"alertname": "HighLatency", "severity": "critical"},
                               "annotations": {"summary": "p99 above 2s"},
                               "status": {"state": "active"}, "startsAt": "2024-01-01T00:00:00Z"}),
                    ];
                    if !query.contains("filter=") {
                        alerts.push(json!({"labels": {"alertname": "DiskFilling", "severity": "warning"},
                                           "annotations": {}, "status": {"state": "active"},
                                           "startsAt": "2024-01-01T00:00:00Z"}));
                    }
                    Json(Value::Array(alerts))
                }),
            )
            .route(
                "/api/v2/silences",
                get(|| async {
                    Json(json!([
                        {"id": "s1", "status": {"state": "active"}, "matchers": [], "createdBy": "ops", "comment": "maint", "endsAt": "2024-01-02T00:00:00Z"},
                        {"id": "s2", "status": {"state": "expired"}, "matchers": [], "createdBy": "ops", "comment": "old", "endsAt": "2023-01-02T00:00:00Z"}
                    ]))
                }),
            );
        serve(router).await
    }

    async fn service() -> AlertmanagerService {
        let spec = ServiceSpec {
            name: "alerts".to_string(),
            service_type: SERVICE_TYPE.to_string(),
            description: "Team alertmanager".to_string(),
        };
        AlertmanagerService::new(
            spec,
            AlertmanagerOptions {
                url: mock_alertmanager().await,
                timeout: None,
            },
        )
        .unwrap()
    }

    fn request(value: Value) -> AlertmanagerRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_list_alerts_groups_by_severity() {
        let service = service().await;
        let response = service
            .handle(request(json!({"operation": "list_alerts", "list_alerts": {}})))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.message, "2 firing alerts");
        assert_eq!(response.payload["by_severity"], json!({"critical": 1, "warning": 1}));
        assert_eq!(response.payload["alerts"][0]["summary"], "p99 above 2s");

        let response = service
            .handle(request(json!({"operation": "list_alerts", "list_alerts": {"filter": ["severity=\"critical\""]}})))
            .await
            .unwrap();
        assert_eq!(response.message, "1 firing alerts");
    }

    #[tokio::test]
    async fn test_list_silences_filters_state() {
        let service = service().await;
        let response = service
            .handle(request(json!({"operation": "list_silences", "list_silences": {"state": "active"}})))
            .await
            .unwrap();
        assert_eq!(response.message, "1 silences");
        assert_eq!(response.payload["silences"][0]["id"], "s1");
    }

    #[tokio::test]
    async fn test_dispatch_edges() {
        let service = service().await;
        assert_eq!(service.description(), "Team alertmanager");

        let response = service.handle(request(json!({"operation": "list_alerts"}))).await.unwrap();
        assert_eq!(response.message, "missing list_alerts params");
        let response = service.handle(request(json!({"operation": "silence"}))).await.unwrap();
        assert_eq!(response.message, "unknown operation: silence");
    }

    #[test]
    fn test_request_reparses() {
        let value = assert_reparses::<AlertmanagerRequest>(
            r#"{"operation":"list_alerts","list_alerts":{"filter":["severity=\"critical\""],"silenced":true}}"#,
        );
        assert_eq!(value["list_alerts"]["inhibited"], false);
        assert!(value.get("list_silences").is_none());

        let value = assert_reparses::<AlertmanagerRequest>(r#"{"operation":"list_silences","list_silences":{}}"#);
        assert!(value["list_silences"].get("state").is_none());

        assert_reparses::<AlertmanagerRequest>(r#"{"operation":"list_silences","list_silences":{"state":"active"}}"#);
    }
}
