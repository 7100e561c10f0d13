//! Conversation sessions
//!
//! - `InMemorySession`: plain append-only session
//! - `ManagedSession`: session with incremental summarisation
//! - `persist`: human-readable session documents with an embedded JSON dump

mod managed;
mod persist;
mod summarizer;

pub use managed::{CompressionPolicy, ManagedSession, SUMMARY_STATE_KEY, SUMMARY_UPDATED_AT_KEY};
pub use persist::*;
pub use summarizer::{LlmSummarizer, Summarizer, SUMMARIZER_INSTRUCTION};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::agents::domain::Message;
use crate::agents::error::AgentResult;

/// Conversational state shared by every agent serving one user
///
/// Safe for one writer and many readers. `append` followed by `history` on
/// the same task observes the append.
#[async_trait]
pub trait Session: Send + Sync {
    /// Stable identifier, preserved across save/load
    fn id(&self) -> &str;

    /// A copy of the state map
    fn state(&self) -> HashMap<String, Value>;

    fn set_state(&self, key: &str, value: Value);

    /// A consistent snapshot of the history
    fn history(&self) -> Vec<Message>;

    async fn append(&self, message: Message) -> AgentResult<()>;
}

/// Sessions are shared between the caller and every agent in a run
pub type SharedSession = Arc<dyn Session>;

#[derive(Default)]
struct SessionData {
    state: HashMap<String, Value>,
    history: Vec<Message>,
}

/// Append-only in-memory session
pub struct InMemorySession {
    id: String,
    data: RwLock<SessionData>,
}

impl InMemorySession {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: RwLock::new(SessionData::default()),
        }
    }

    /// Rebuild a session from persisted parts
    pub fn from_parts(id: impl Into<String>, state: HashMap<String, Value>, history: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            data: RwLock::new(SessionData { state, history }),
        }
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(self)
    }
}

impl Default for InMemorySession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for InMemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> HashMap<String, Value> {
        self.data.read().state.clone()
    }

    fn set_state(&self, key: &str, value: Value) {
        self.data.write().state.insert(key.to_string(), value);
    }

    fn history(&self) -> Vec<Message> {
        self.data.read().history.clone()
    }

    async fn append(&self, message: Message) -> AgentResult<()> {
        self.data.write().history.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_then_history() {
        let session = InMemorySession::with_id("s-1");
        session.append(Message::user("hello")).await.unwrap();
        session.append(Message::assistant("hi")).await.unwrap();

        let history = session.history();
        assert_eq!(session.id(), "s-1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "hi");
    }

    #[tokio::test]
    async fn test_state_is_cloned() {
        let session = InMemorySession::new();
        session.set_state("region", Value::String("eu-west-1".to_string()));

        let mut snapshot = session.state();
        snapshot.insert("region".to_string(), Value::Null);
        assert_eq!(session.state()["region"], "eu-west-1");
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_consistent_snapshots() {
        let session: SharedSession = InMemorySession::new().shared();
        let writer = {
            let session = session.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    session.append(Message::user(format!("m{}", i))).await.unwrap();
                }
            })
        };
        for _ in 0..50 {
            let snapshot = session.history();
            for (i, message) in snapshot.iter().enumerate() {
                assert_eq!(message.content, format!("m{}", i));
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(session.history().len(), 100);
    }
}
