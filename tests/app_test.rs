mod common;

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use patrol::agents::domain::Role;
use patrol::agents::error::AgentError;
use patrol::agents::llm::{ScriptedProvider, ScriptedTurn};
use patrol::agents::memory::SUMMARY_STATE_KEY;
use patrol::app::{RunOptions, SHUTDOWN_DEADLINE};

use common::{agents_toml, app_from, mock_monitoring};

fn inspection_toml(url: &str) -> String {
    format!(
        "{}\n[services.prometheus]\ntype = \"prometheus\"\noptions = {{ url = \"{url}\" }}\n\n[services.alertmanager]\ntype = \"alertmanager\"\noptions = {{ url = \"{url}\" }}\n",
        agents_toml(&["orchestrator", "service_agent", "prediction_agent", "report_agent"]),
    )
}

#[tokio::test]
async fn test_full_inspection_runs_every_step() -> anyhow::Result<()> {
    let url = mock_monitoring().await;
    let orchestrator = ScriptedProvider::new([ScriptedTurn::handoff("analysis")]);
    let service = ScriptedProvider::new([
        ScriptedTurn::tool_call(
            "prometheus",
            json!({"operation": "query_instant", "query_instant": {"query": "node_cpu"}}).to_string(),
        ),
        ScriptedTurn::text("cpu at 93% on web-1"),
    ]);
    let prediction = ScriptedProvider::new([ScriptedTurn::text("web-1 saturates within a day")]);
    let report = ScriptedProvider::new([ScriptedTurn::text("## Summary\nweb-1 is hot")]);

    let app = app_from(
        &inspection_toml(&url),
        &[
            ("orchestrator", orchestrator.clone()),
            ("service_agent", service.clone()),
            ("prediction_agent", prediction.clone()),
            ("report_agent", report.clone()),
        ],
    )?;
    let session = app.new_session();
    let reply = app.run(&session, "inspect web", RunOptions::default()).await?;

    assert_eq!(reply.content, "## Summary\nweb-1 is hot");
    assert_eq!(reply.author(), Some("report_agent"));

    let history = session.history();
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "inspect web");
    let answered_by: Vec<_> = history
        .iter()
        .filter(|m| m.is_final_answer())
        .filter_map(|m| m.author())
        .collect();
    assert_eq!(answered_by, vec!["service_agent", "prediction_agent", "report_agent"]);

    let tool_result = history
        .iter()
        .find(|m| m.role == Role::Tool && m.name.as_deref() == Some("prometheus"))
        .expect("prometheus result in history");
    let result: serde_json::Value = serde_json::from_str(&tool_result.content)?;
    assert_eq!(result["success"], true);
    assert_eq!(result["result"][0]["metric"]["query"], "node_cpu");

    let tool_names = |provider: &ScriptedProvider| -> Vec<String> {
        provider.requests()[0]
            .tools
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.name)
            .collect()
    };
    assert_eq!(tool_names(&service), vec!["alertmanager", "prometheus"]);
    assert_eq!(tool_names(&prediction), vec!["prometheus"]);
    assert!(tool_names(&report).is_empty());

    // Later steps see the earlier findings
    let seen: Vec<_> = prediction.requests()[0].messages.iter().map(|m| m.content.clone()).collect();
    assert!(seen.iter().any(|c| c == "cpu at 93% on web-1"));
    assert_eq!(seen.last().map(String::as_str), Some("inspect web"));
    Ok(())
}

#[tokio::test]
async fn test_direct_answer_skips_children() -> anyhow::Result<()> {
    let orchestrator = ScriptedProvider::new([ScriptedTurn::text("I run inspections.")]);
    let general = ScriptedProvider::new(Vec::new());
    let app = app_from(
        &agents_toml(&["orchestrator", "general_agent"]),
        &[("orchestrator", orchestrator), ("general_agent", general.clone())],
    )?;

    let session = app.new_session();
    let reply = app.run(&session, "what can you do?", RunOptions::default()).await?;

    assert_eq!(reply.content, "I run inspections.");
    assert_eq!(reply.author(), Some("orchestrator"));
    assert!(general.requests().is_empty());
    assert_eq!(session.history().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unknown_handoff_target_fails_turn() -> anyhow::Result<()> {
    let orchestrator = ScriptedProvider::new([ScriptedTurn::handoff("janitor")]);
    let app = app_from(
        &agents_toml(&["orchestrator", "general_agent"]),
        &[
            ("orchestrator", orchestrator),
            ("general_agent", ScriptedProvider::new(Vec::new())),
        ],
    )?;

    let session = app.new_session();
    let err = app.run(&session, "mop the floor", RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, AgentError::TargetNotFound(ref name) if name == "janitor"));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_turn_reports_cancellation() -> anyhow::Result<()> {
    let orchestrator = ScriptedProvider::new([ScriptedTurn::text("too late")]).with_delay(Duration::from_secs(30));
    let app = app_from(
        &agents_toml(&["orchestrator", "general_agent"]),
        &[
            ("orchestrator", orchestrator),
            ("general_agent", ScriptedProvider::new(Vec::new())),
        ],
    )?;

    let session = app.new_session();
    let cancel = CancellationToken::new();
    let mut stream = app.run_stream(&session, "hello", RunOptions::default().with_cancel(cancel.clone()));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let mut last = None;
    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(item) = stream.next().await {
            last = Some(item);
        }
    })
    .await;
    assert!(outcome.is_ok(), "cancellation did not end the stream");
    assert!(matches!(last, Some(Err(ref e)) if e.is_cancelled()));
    Ok(())
}

#[tokio::test]
async fn test_long_turn_is_summarised_with_summary_model() -> anyhow::Result<()> {
    let toml = format!(
        "[conversation]\nretain_recent_messages = 1\n\n{}",
        agents_toml(&["orchestrator", "general_agent"])
    );
    let orchestrator = ScriptedProvider::new([
        ScriptedTurn::text("hello").with_input_tokens(120_000),
        ScriptedTurn::text("## Facts\n- operator said hi"),
    ]);
    let app = app_from(
        &toml,
        &[
            ("orchestrator", orchestrator.clone()),
            ("general_agent", ScriptedProvider::new(Vec::new())),
        ],
    )?;

    let session = app.new_session();
    let reply = app.run(&session, "hi", RunOptions::default()).await?;
    assert_eq!(reply.content, "hello");

    let state = session.state();
    assert_eq!(state[SUMMARY_STATE_KEY], json!("## Facts\n- operator said hi"));

    let history = session.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::System);
    assert!(history[0].content.contains("operator said hi"));
    assert_eq!(history[1].content, "hello");

    let summary_request = &orchestrator.requests()[1];
    assert!(summary_request.messages.iter().any(|m| m.content.contains("hi")));
    Ok(())
}

#[tokio::test]
async fn test_saved_session_resumes() -> anyhow::Result<()> {
    let orchestrator = ScriptedProvider::new([ScriptedTurn::text("first"), ScriptedTurn::text("second")]);
    let app = app_from(
        &agents_toml(&["orchestrator", "general_agent"]),
        &[
            ("orchestrator", orchestrator.clone()),
            ("general_agent", ScriptedProvider::new(Vec::new())),
        ],
    )?;

    let session = app.new_session();
    session.set_state("service_of_interest", json!("checkout"));
    app.run(&session, "one", RunOptions::default()).await?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.md");
    app.save_session(&session, &path).await?;

    let restored = app.load_session(&path).await?;
    assert_eq!(restored.id(), session.id());
    assert_eq!(restored.state()["service_of_interest"], json!("checkout"));
    let contents: Vec<_> = restored.history().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["one", "first"]);

    let reply = app.run(&restored, "two", RunOptions::default()).await?;
    assert_eq!(reply.content, "second");
    let seen: Vec<_> = orchestrator.requests()[1].messages.iter().map(|m| m.content.clone()).collect();
    assert!(seen.contains(&"first".to_string()));
    assert_eq!(seen.last().map(String::as_str), Some("two"));
    Ok(())
}

#[tokio::test]
async fn test_missing_session_file_is_persistence_error() -> anyhow::Result<()> {
    let app = app_from(
        &agents_toml(&["orchestrator", "general_agent"]),
        &[
            ("orchestrator", ScriptedProvider::new(Vec::new())),
            ("general_agent", ScriptedProvider::new(Vec::new())),
        ],
    )?;
    let dir = tempfile::tempdir()?;
    match app.load_session(dir.path().join("absent.md")).await {
        Err(err) => assert!(matches!(err, AgentError::Persistence(_))),
        Ok(_) => panic!("loading a missing file should fail"),
    }
    Ok(())
}

#[tokio::test]
async fn test_shutdown_is_idempotent() -> anyhow::Result<()> {
    let url = mock_monitoring().await;
    let app = app_from(
        &inspection_toml(&url),
        &[
            ("orchestrator", ScriptedProvider::new(Vec::new())),
            ("service_agent", ScriptedProvider::new(Vec::new())),
            ("prediction_agent", ScriptedProvider::new(Vec::new())),
            ("report_agent", ScriptedProvider::new(Vec::new())),
        ],
    )?;

    let health = app.health().await;
    assert_eq!(health.len(), 2);
    assert!(health.iter().all(|(_, result)| result.is_ok()));

    let first = app.shutdown(SHUTDOWN_DEADLINE).await;
    assert!(first.is_clean());
    assert!(app.services().is_closed());
    let second = app.shutdown(SHUTDOWN_DEADLINE).await;
    assert!(second.is_clean());
    Ok(())
}
