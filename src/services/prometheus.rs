//! Prometheus metrics store

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::HeaderMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::{
    require, HttpServiceClient, Service, ServiceError, ServiceHandler, ServiceResponse, ServiceSpec,
    ServiceTypeRegistry,
};
use crate::agents::tool::{ServiceTool, Tool};

pub const SERVICE_TYPE: &str = "prometheus";

/// Series returned to the model per query
const MAX_SERIES: usize = 50;
const DEFAULT_STEP: &str = "60s";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusOptions {
    pub url: String,
    /// Per-call timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PrometheusRequest {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_instant: Option<InstantQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_range: Option<RangeQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_targets: Option<TargetFilter>,
}

/// Evaluate a PromQL expression at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InstantQuery {
    /// PromQL expression
    pub query: String,
    /// Evaluation time: RFC 3339, unix seconds, `now`, or relative such as `-1h`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// Evaluate a PromQL expression over a time range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RangeQuery {
    /// PromQL expression
    pub query: String,
    /// Range start: RFC 3339, unix seconds, `now`, or relative such as `-24h` (default `-1h`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Range end (default `now`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Resolution step such as `60s` or `5m` (default `60s`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TargetFilter {
    /// `active` (default), `dropped` or `any`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Only targets of this scrape job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

pub struct PrometheusService {
    spec: ServiceSpec,
    http: HttpServiceClient,
}

impl PrometheusService {
    pub fn new(spec: ServiceSpec, options: PrometheusOptions) -> Result<Self, ServiceError> {
        let http = HttpServiceClient::new(spec.name.clone(), &options.url, options.timeout, HeaderMap::new())?;
        Ok(Self { spec, http })
    }

    async fn query_instant(&self, params: InstantQuery) -> Result<ServiceResponse, ServiceError> {
        let op = "query_instant";
        let mut query = vec![("query", params.query.clone())];
        if let Some(time) = params.time.as_deref() {
            match resolve_time(time, Utc::now()) {
                Ok(t) => query.push(("time", t)),
                Err(message) => return Ok(ServiceResponse::failure(op, message)),
            }
        }

        let reply = self.http.get("/api/v1/query", &query).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }
        Ok(series_response(op, &params.query, &reply.body["data"]))
    }

    async fn query_range(&self, params: RangeQuery) -> Result<ServiceResponse, ServiceError> {
        let op = "query_range";
        let now = Utc::now();
        let start = resolve_time(params.start.as_deref().unwrap_or("-1h"), now);
        let end = resolve_time(params.end.as_deref().unwrap_or("now"), now);
        let (start, end) = match (start, end) {
            (Ok(start), Ok(end)) => (start, end),
            (Err(message), _) | (_, Err(message)) => return Ok(ServiceResponse::failure(op, message)),
        };
        let step = params.step.clone().unwrap_or_else(|| DEFAULT_STEP.to_string());

        let query = [
            ("query", params.query.clone()),
            ("start", start.clone()),
            ("end", end.clone()),
            ("step", step.clone()),
        ];
        let reply = self.http.get("/api/v1/query_range", &query).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }
        Ok(series_response(op, &params.query, &reply.body["data"])
            .with("start", start)
            .with("end", end)
            .with("step", step))
    }

    async fn list_targets(&self, filter: TargetFilter) -> Result<ServiceResponse, ServiceError> {
        let op = "list_targets";
        let state = filter.state.clone().unwrap_or_else(|| "active".to_string());
        let reply = self.http.get("/api/v1/targets", &[("state", state.clone())]).await?;
        if !reply.is_success() {
            return Ok(reply.failure(op));
        }

        let data = &reply.body["data"];
        let mut targets = Vec::new();
        for key in ["activeTargets", "droppedTargets"] {
            for target in data[key].as_array().into_iter().flatten() {
                let labels = if target["labels"].is_object() {
                    &target["labels"]
                } else {
                    &target["discoveredLabels"]
                };
                let job = labels["job"].as_str().unwrap_or_default();
                if filter.job.as_deref().map_or(false, |wanted| wanted != job) {
                    continue;
                }
                targets.push(json!({
                    "job": job,
                    "instance": labels["instance"].as_str().or(labels["__address__"].as_str()),
                    "health": target["health"].as_str().unwrap_or("unknown"),
                    "last_error": target["lastError"].as_str().filter(|e| !e.is_empty()),
                    "last_scrape": target["lastScrape"],
                }));
            }
        }

        let down = targets.iter().filter(|t| t["health"] == "down").count();
        Ok(ServiceResponse::ok(op, format!("{} targets, {} down", targets.len(), down))
            .with("state", state)
            .with("down", down)
            .with("targets", targets))
    }
}

/// Shape a `{resultType, result}` block, capping the number of series
fn series_response(operation: &str, query: &str, data: &Value) -> ServiceResponse {
    let result_type = data["resultType"].as_str().unwrap_or("unknown").to_string();
    let (result, total) = match data["result"].as_array() {
        Some(series) => (
            Value::Array(series.iter().take(MAX_SERIES).cloned().collect()),
            series.len(),
        ),
        None => (data["result"].clone(), usize::from(!data["result"].is_null())),
    };

    let mut response = ServiceResponse::ok(operation, format!("{} {} result(s) for {}", total, result_type, query))
        .with("result_type", result_type)
        .with("result", result);
    if total > MAX_SERIES {
        response = response.with("truncated", true).with("total_series", total);
    }
    response
}

/// Resolve a time expression to something the HTTP API accepts
///
/// Relative offsets (`-90s`, `-15m`, `-6h`, `-7d`, `-1w`) are taken from `now`.
pub fn resolve_time(input: &str, now: DateTime<Utc>) -> Result<String, String> {
    let input = input.trim();
    if input.is_empty() || input.eq_ignore_ascii_case("now") {
        return Ok(now.to_rfc3339());
    }
    if let Some(offset) = input.strip_prefix('-') {
        let duration = parse_duration(offset).ok_or_else(|| format!("invalid relative time: {}", input))?;
        return Ok((now - duration).to_rfc3339());
    }
    if input.parse::<f64>().is_ok() {
        return Ok(input.to_string());
    }
    DateTime::parse_from_rfc3339(input)
        .map(|t| t.with_timezone(&Utc).to_rfc3339())
        .map_err(|_| format!("invalid time: {}", input))
}

fn parse_duration(text: &str) -> Option<ChronoDuration> {
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = text.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    match unit {
        "s" => Some(ChronoDuration::seconds(amount)),
        "m" => Some(ChronoDuration::minutes(amount)),
        "h" => Some(ChronoDuration::hours(amount)),
        "d" => Some(ChronoDuration::days(amount)),
        "w" => Some(ChronoDuration::weeks(amount)),
        _ => None,
    }
}

#[async_trait]
impl Service for PrometheusService {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn service_type(&self) -> &str {
        SERVICE_TYPE
    }

    fn description(&self) -> &str {
        if self.spec.description.is_empty() {
            "Prometheus metrics: PromQL instant and range queries, scrape target health."
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
impl ServiceHandler for PrometheusService {
    type Request = PrometheusRequest;

    const OPERATIONS: &'static [&'static str] = &["query_instant", "query_range", "list_targets"];

    async fn handle(&self, request: PrometheusRequest) -> Result<ServiceResponse, ServiceError> {
        let op = request.operation.as_str();
        match op {
            "query_instant" => match require(op, request.query_instant) {
                Ok(params) => self.query_instant(params).await,
                Err(response) => Ok(response),
            },
            "query_range" => match require(op, request.query_range) {
                Ok(params) => self.query_range(params).await,
                Err(response) => Ok(response),
            },
            "list_targets" => match require(op, request.list_targets) {
                Ok(filter) => self.list_targets(filter).await,
                Err(response) => Ok(response),
            },
            other => Ok(ServiceResponse::unknown_operation(other)),
        }
    }
}

pub(crate) fn register(types: &ServiceTypeRegistry) {
    types.register::<PrometheusOptions, _>(SERVICE_TYPE, |spec, options| {
        Ok(Arc::new(PrometheusService::new(spec, options)?) as Arc<dyn Service>)
    });
}
