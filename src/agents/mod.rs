//! Agent runtime
//!
//! ## Architecture
//!
//! - `domain/` - Core types (Message, ToolCall, Invocation, AgentStream)
//! - `llm/` - LLM providers with streaming, and the model registry
//! - `tool/` - Tool protocol and the service tool adapter
//! - `core/` - The leaf agent and its model/tool loop
//! - `middleware/` - Handler pipeline around leaf agents
//! - `orchestration/` - Sequential and routing composites
//! - `memory/` - Sessions, summarisation and persistence

pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod llm;
pub mod memory;
pub mod middleware;
pub mod orchestration;
pub mod tool;

// Re-export commonly used types
pub use config::*;
pub use domain::*;
pub use error::*;
pub use self::core::{Agent, LlmAgent};
pub use memory::{InMemorySession, ManagedSession, Session, SharedSession};
pub use orchestration::{RoutingAgent, SequentialAgent};
