//! # Patrol - SRE inspection assistant
//!
//! Patrol answers operations questions by routing them through a small tree
//! of LLM agents that query monitoring services as tools.
//!
//! ## Features
//!
//! - **Routing**: an orchestrator answers directly or hands off to one agent
//! - **Full inspection**: service, prediction and report agents run in sequence
//! - **Services**: Prometheus, Alertmanager, Elasticsearch and PagerDuty as tools
//! - **Long conversations**: sessions summarise older history incrementally
//! - **Persistence**: sessions save to and load from readable documents
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use patrol::app::{App, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = App::bootstrap("patrol.toml").await?;
//!     let session = app.new_session();
//!     let reply = app.run(&session, "Is the checkout service healthy?", RunOptions::default()).await?;
//!     println!("{}", reply.content);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **agents**: runtime (messages, models, tools, agents, sessions)
//! - **services**: monitoring service plugins and their registry
//! - **config**: configuration loading and validation
//! - **app**: lifecycle wiring everything together

pub mod agents;
pub mod app;
pub mod cli;
pub mod config;
pub mod prompts;
pub mod server;
pub mod services;
