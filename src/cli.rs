use clap::Parser;
use std::path::PathBuf;

/// LLM-driven SRE inspection assistant
#[derive(Parser, Debug, Clone)]
#[command(name = "patrol", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "PATROL_CONFIG", default_value = "patrol.toml")]
    pub config: PathBuf,

    /// Serve the HTTP endpoints on `server.addr` instead of reading stdin
    #[arg(long)]
    pub serve: bool,
}

/// One line read at the interactive prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplCommand<'a> {
    Exit,
    Help,
    Reset,
    Save(&'a str),
    Load(&'a str),
    /// A command that needs an argument, carrying its usage
    Usage(&'static str),
    Chat(&'a str),
}

impl<'a> ReplCommand<'a> {
    /// Commands are matched on the whole first word
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        match (word, rest) {
            ("exit" | "quit", "") => Self::Exit,
            ("/help", "") => Self::Help,
            ("/reset", "") => Self::Reset,
            ("/save", "") => Self::Usage("/save <path>"),
            ("/save", path) => Self::Save(path),
            ("/load", "") => Self::Usage("/load <path>"),
            ("/load", path) => Self::Load(path),
            _ => Self::Chat(line),
        }
    }
}
