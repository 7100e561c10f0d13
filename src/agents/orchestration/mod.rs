//! Composite agents
//!
//! - `SequentialAgent`: children run in order over one shared session
//! - `RoutingAgent`: a model picks at most one child through `handoff_to_agent`

mod routing;
mod sequential;

pub use routing::{handoff_tool, RoutingAgent, HANDOFF_ACTION, HANDOFF_TOOL};
pub use sequential::SequentialAgent;
