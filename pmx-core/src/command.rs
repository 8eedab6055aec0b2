//! Client-side view of a running command: its event stream and outcome.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::message::CorrelationId;

/// Why a command ended as cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's token fired.
    Local,
    /// The server confirmed cancellation.
    Remote,
    /// The connection dropped while the command was in flight.
    ConnectionLost(String),
}

/// Terminal outcome of a command. Reached exactly once per command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed,
    Faulted(String),
    Cancelled(CancelReason),
}

impl CommandOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CommandOutcome::Cancelled(_))
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Completed => write!(f, "completed"),
            CommandOutcome::Faulted(msg) => write!(f, "faulted: {msg}"),
            CommandOutcome::Cancelled(CancelReason::Local) => write!(f, "cancelled"),
            CommandOutcome::Cancelled(CancelReason::Remote) => {
                write!(f, "cancelled by server")
            }
            CommandOutcome::Cancelled(CancelReason::ConnectionLost(reason)) => {
                write!(f, "cancelled: connection lost ({reason})")
            }
        }
    }
}

/// One item of a [`CommandStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// A line of output, in send order.
    Chunk(String),
    /// The last event of the stream.
    Finished(CommandOutcome),
}

// ── CommandStream ────────────────────────────────────────────────

/// Output of one `execute` call.
///
/// Yields `Chunk`s, then exactly one `Finished`, then ends.
#[derive(Debug)]
pub struct CommandStream {
    id: CorrelationId,
    inner: UnboundedReceiverStream<CommandEvent>,
    finished: bool,
}

impl CommandStream {
    pub(crate) fn new(id: CorrelationId, rx: mpsc::UnboundedReceiver<CommandEvent>) -> Self {
        Self {
            id,
            inner: UnboundedReceiverStream::new(rx),
            finished: false,
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Drain the stream, returning every chunk and the outcome.
    pub async fn finish(mut self) -> (Vec<String>, CommandOutcome) {
        let mut chunks = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                CommandEvent::Chunk(line) => chunks.push(line),
                CommandEvent::Finished(outcome) => return (chunks, outcome),
            }
        }
        // Unreachable: poll_next always yields Finished before ending.
        (
            chunks,
            CommandOutcome::Cancelled(CancelReason::ConnectionLost(
                "command stream ended".into(),
            )),
        )
    }
}

impl Stream for CommandStream {
    type Item = CommandEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(event)) => {
                if matches!(event, CommandEvent::Finished(_)) {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            // The sink vanished without a terminal event: the owning
            // client was dropped.
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(CommandEvent::Finished(CommandOutcome::Cancelled(
                    CancelReason::ConnectionLost("client dropped".into()),
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
