//! Domain types for the agent runtime
//!
//! Core abstractions that define the runtime's domain model.

mod invocation;
mod message;
mod stream;
mod tool_call;

pub use invocation::*;
pub use message::*;
pub use stream::*;
pub use tool_call::*;
