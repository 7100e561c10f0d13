#![allow(dead_code)]

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use patrol::agents::llm::{ModelRegistry, ScriptedProvider};
use patrol::app::App;
use patrol::config::Settings;
use patrol::services::{register_builtin_services, service_types, ServiceRegistry};

/// Serve `router` on an ephemeral local port and return its base URL
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Prometheus (and Alertmanager health) stand-in answering a CPU query
pub async fn mock_monitoring() -> String {
    let router = Router::new()
        .route("/-/healthy", get(|| async { "OK" }))
        .route(
            "/api/v1/query",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                Json(json!({
                    "status": "success",
                    "data": {"resultType": "vector", "result": [
                        {"metric": {"instance": "web-1", "query": q["query"]}, "value": [1700000000, "0.93"]}
                    ]}
                }))
            }),
        );
    serve(router).await
}

pub fn agents_toml(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| format!("[agents.{}.llm]\nprovider = \"openai\"\nmodel = \"gpt-4o\"\n", name))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Scripted models keyed by agent name, in the order given
pub fn scripted_models(providers: &[(&str, ScriptedProvider)]) -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    for (name, provider) in providers {
        registry.insert(*name, Arc::new(provider.clone()));
    }
    registry
}

/// Assemble an app from TOML with real services and scripted models
pub fn app_from(toml: &str, providers: &[(&str, ScriptedProvider)]) -> anyhow::Result<App> {
    let settings = Arc::new(Settings::from_toml(toml)?);
    register_builtin_services();
    let services = ServiceRegistry::build(service_types(), settings.services.iter())?;
    Ok(App::assemble(settings, services, scripted_models(providers))?)
}
