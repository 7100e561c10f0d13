use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use patrol::agents::domain::{MessageStatus, Role};
use patrol::agents::memory::SharedSession;
use patrol::app::{App, RunOptions, SHUTDOWN_DEADLINE};
use patrol::cli::{Cli, ReplCommand};

const HELP: &str = "Commands: /save <path>, /load <path>, /reset, /help, exit, quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let app = App::bootstrap(&cli.config)
        .await
        .with_context(|| format!("failed to start from {}", cli.config.display()))?;
    let app = Arc::new(app);

    let result = if cli.serve {
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        patrol::server::serve(app.clone(), shutdown)
            .await
            .context("server failed")
    } else {
        repl(&app).await
    };

    let report = app.shutdown(SHUTDOWN_DEADLINE).await;
    if !report.is_clean() {
        warn!(?report, "Shutdown finished with errors");
    }
    result
}

async fn repl(app: &App) -> anyhow::Result<()> {
    let mut session = app.new_session();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("patrol ready. {}", HELP);

    loop {
        prompt();
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match ReplCommand::parse(line) {
            ReplCommand::Exit => break,
            ReplCommand::Help => println!("{}", HELP),
            ReplCommand::Reset => {
                session = app.new_session();
                println!("Started session {}", session.id());
            }
            ReplCommand::Usage(usage) => println!("usage: {}", usage),
            ReplCommand::Save(path) => match app.save_session(&session, path).await {
                Ok(()) => println!("Saved session {} to {}", session.id(), path),
                Err(e) => eprintln!("error: {}", e),
            },
            ReplCommand::Load(path) => match app.load_session(path).await {
                Ok(loaded) => {
                    session = loaded;
                    println!("Loaded session {} ({} messages)", session.id(), session.history().len());
                }
                Err(e) => eprintln!("error: {}", e),
            },
            ReplCommand::Chat(text) => run_turn(app, &session, text).await,
        }
    }

    info!("Goodbye");
    Ok(())
}

/// Stream one turn to stdout; Ctrl-C cancels it
async fn run_turn(app: &App, session: &SharedSession, text: &str) {
    let cancel = CancellationToken::new();
    let mut stream = app.run_stream(session, text, RunOptions::default().with_cancel(cancel.clone()));
    let mut streamed = false;

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                cancel.cancel();
                continue;
            }
        };
        let Some(item) = item else { break };

        match item {
            Ok(message) if message.status == MessageStatus::Streaming => {
                print!("{}", message.content);
                let _ = std::io::stdout().flush();
                streamed = true;
            }
            Ok(message) if message.role == Role::Assistant && message.has_tool_calls() => {
                let names: Vec<_> = message.calls().iter().map(|c| c.name.as_str()).collect();
                if streamed {
                    println!();
                    streamed = false;
                }
                println!("[{} -> {}]", message.author().unwrap_or("agent"), names.join(", "));
            }
            Ok(message) if message.is_final_answer() => {
                if !streamed {
                    print!("{}", message.content);
                }
                println!();
                streamed = false;
            }
            Ok(_) => {}
            Err(e) if e.is_cancelled() => {
                println!("\n(cancelled)");
                break;
            }
            Err(e) => {
                eprintln!("\nerror: {}", e);
                break;
            }
        }
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
