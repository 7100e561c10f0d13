//! The agent generator: a lazy, single-pass sequence of messages
//!
//! Producers run in a spawned task and push into a bounded channel. A failed
//! send means the consumer dropped the stream, and the producer must stop
//! doing work. Errors are terminal: nothing is sent after an `Err`.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::Message;
use crate::agents::error::{AgentError, AgentResult};

/// Default channel capacity for agent streams
pub const STREAM_BUFFER: usize = 64;

/// Streaming output of an agent run
pub struct AgentStream {
    receiver: mpsc::Receiver<AgentResult<Message>>,
}

/// How a piped stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    /// The source ran to completion
    Completed,
    /// The source yielded an error, which was forwarded
    Failed,
    /// The consumer went away
    Closed,
}

impl AgentStream {
    /// Create a new agent stream from a channel receiver
    pub fn new(receiver: mpsc::Receiver<AgentResult<Message>>) -> Self {
        Self { receiver }
    }

    /// Create a channel pair for building an agent stream
    pub fn channel(buffer: usize) -> (AgentStreamSender, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (AgentStreamSender { sender: tx }, Self { receiver: rx })
    }

    /// A stream that yields a single error and ends
    pub fn from_error(error: AgentError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(Err(error));
        Self { receiver: rx }
    }

    /// Drain the stream and return the last final answer
    ///
    /// The first error aborts the drain and is returned.
    pub async fn final_message(mut self) -> AgentResult<Message> {
        let mut last = None;
        while let Some(item) = self.next().await {
            let message = item?;
            if message.is_final_answer() {
                last = Some(message);
            }
        }
        last.ok_or_else(|| AgentError::Internal("agent produced no final answer".to_string()))
    }

    /// Drain the stream, keeping every message
    pub async fn collect_messages(mut self) -> AgentResult<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(item) = self.next().await {
            messages.push(item?);
        }
        Ok(messages)
    }
}

impl Stream for AgentStream {
    type Item = AgentResult<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}

/// Returned when the consumer side of a stream has been dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

/// Sender half for building an agent stream
#[derive(Clone)]
pub struct AgentStreamSender {
    sender: mpsc::Sender<AgentResult<Message>>,
}

impl AgentStreamSender {
    /// Send a message
    pub async fn send(&self, message: Message) -> Result<(), StreamClosed> {
        self.sender.send(Ok(message)).await.map_err(|_| StreamClosed)
    }

    /// Send an error
    pub async fn send_error(&self, error: AgentError) -> Result<(), StreamClosed> {
        self.sender.send(Err(error)).await.map_err(|_| StreamClosed)
    }

    /// Check if the receiver is closed
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Forward every item of `source` until it ends, fails, or the consumer leaves
    pub async fn pipe(&self, mut source: AgentStream) -> PipeOutcome {
        while let Some(item) = source.next().await {
            let failed = item.is_err();
            if self.sender.send(item).await.is_err() {
                return PipeOutcome::Closed;
            }
            if failed {
                return PipeOutcome::Failed;
            }
        }
        PipeOutcome::Completed
    }
}
