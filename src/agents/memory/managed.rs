//! Session with incremental summarisation
//!
//! History stores only real turns. The rolling summary lives in state and is
//! injected as a system message at the head of `history()`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Session, SharedSession, Summarizer};
use crate::agents::domain::{Message, Role};
use crate::agents::error::{AgentError, AgentResult};

pub const SUMMARY_STATE_KEY: &str = "conversation_summary";
pub const SUMMARY_UPDATED_AT_KEY: &str = "conversation_summary_updated_at";

const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:\n";

/// When and how much history to compress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionPolicy {
    pub context_window_tokens: u32,
    /// Fraction of the window, in (0, 1]
    pub compression_threshold: f64,
    pub max_in_context_messages: usize,
    pub retain_recent_messages: usize,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            context_window_tokens: 128_000,
            compression_threshold: 0.8,
            max_in_context_messages: 50,
            retain_recent_messages: 16,
        }
    }
}

impl CompressionPolicy {
    pub fn token_limit(&self) -> u32 {
        (self.context_window_tokens as f64 * self.compression_threshold).floor() as u32
    }

    /// Whether appending `message` onto a history of `history_len` real turns fires
    pub fn should_compress(&self, message: &Message, history_len: usize) -> bool {
        if message.role != Role::Assistant || !message.is_completed() {
            return false;
        }
        message.input_tokens() >= self.token_limit() || history_len > self.max_in_context_messages
    }
}

#[derive(Default)]
struct Inner {
    state: HashMap<String, Value>,
    history: Vec<Message>,
}

/// Session that compresses older turns into a rolling summary
pub struct ManagedSession {
    id: String,
    policy: CompressionPolicy,
    summarizer: Arc<dyn Summarizer>,
    inner: Mutex<Inner>,
    summarizing: AtomicBool,
}

impl ManagedSession {
    pub fn new(policy: CompressionPolicy, summarizer: Arc<dyn Summarizer>) -> Self {
        Self::restore(Uuid::new_v4().to_string(), HashMap::new(), Vec::new(), policy, summarizer)
    }

    /// Rebuild a session from persisted parts
    pub fn restore(
        id: impl Into<String>,
        state: HashMap<String, Value>,
        history: Vec<Message>,
        policy: CompressionPolicy,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            id: id.into(),
            policy,
            summarizer,
            inner: Mutex::new(Inner { state, history }),
            summarizing: AtomicBool::new(false),
        }
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(self)
    }

    pub fn policy(&self) -> &CompressionPolicy {
        &self.policy
    }

    /// Current rolling summary, if any
    pub fn summary(&self) -> Option<String> {
        summary_of(&self.inner.lock().state)
    }

    /// Real turns only, without the injected summary
    pub fn raw_history(&self) -> Vec<Message> {
        self.inner.lock().history.clone()
    }

    async fn compress(&self, cutoff: usize, delta: Vec<Message>, previous: Option<String>) -> AgentResult<()> {
        debug!(
            session_id = %self.id,
            cutoff,
            delta = delta.len(),
            "Summarising session history"
        );

        // Lock is not held across the model call
        let summary = match self.summarizer.summarize(previous.as_deref(), &delta).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Summarisation failed");
                return Err(match e {
                    AgentError::Session(_) => e,
                    other => AgentError::Session(format!("summarisation failed: {}", other)),
                });
            }
        };

        let mut inner = self.inner.lock();
        // Anything appended while we were away is still past the cutoff
        let at = cutoff.min(inner.history.len());
        let tail = inner.history.split_off(at);
        inner.state.insert(SUMMARY_STATE_KEY.to_string(), Value::String(summary));
        inner.state.insert(
            SUMMARY_UPDATED_AT_KEY.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        inner.history = tail;

        info!(
            session_id = %self.id,
            summarised = cutoff,
            retained = inner.history.len(),
            "Session history summarised"
        );
        Ok(())
    }
}

fn summary_of(state: &HashMap<String, Value>) -> Option<String> {
    state
        .get(SUMMARY_STATE_KEY)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Clears the in-progress flag however the summarisation ends
struct SummarizingGuard<'a>(&'a AtomicBool);

impl Drop for SummarizingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for ManagedSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> HashMap<String, Value> {
        self.inner.lock().state.clone()
    }

    fn set_state(&self, key: &str, value: Value) {
        self.inner.lock().state.insert(key.to_string(), value);
    }

    fn history(&self) -> Vec<Message> {
        let inner = self.inner.lock();
        let mut history = Vec::with_capacity(inner.history.len() + 1);
        if let Some(summary) = summary_of(&inner.state) {
            history.push(Message::system(format!("{}{}", SUMMARY_PREFIX, summary)));
        }
        history.extend(inner.history.iter().cloned());
        history
    }

    async fn append(&self, message: Message) -> AgentResult<()> {
        let plan = {
            let mut inner = self.inner.lock();
            let fires = self.policy.should_compress(&message, inner.history.len() + 1);
            inner.history.push(message);

            if !fires {
                None
            } else {
                let len = inner.history.len();
                let cutoff = len.saturating_sub(self.policy.retain_recent_messages);
                if cutoff == 0 || self.summarizing.swap(true, Ordering::SeqCst) {
                    None
                } else {
                    let delta = inner.history[..cutoff].to_vec();
                    Some((cutoff, delta, summary_of(&inner.state)))
                }
            }
        };

        match plan {
            Some((cutoff, delta, previous)) => {
                let _guard = SummarizingGuard(&self.summarizing);
                self.compress(cutoff, delta, previous).await
            }
            None => Ok(()),
        }
    }
}
