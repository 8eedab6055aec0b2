//! Client-side table of in-flight commands.
//!
//! Inserting, resolving from the reader loop, and removing on local
//! cancellation all go through one mutex, so a command is resolved at most
//! once. Resolving an id that is no longer present is a no-op. Once the
//! table has been drained it stays closed and refuses new commands.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::{CancelReason, CommandEvent, CommandOutcome, CommandStream};
use crate::error::PmxError;
use crate::message::{CorrelationId, ResponseStatus};

/// Where a pending command is in its `Sent → Streaming → terminal` life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPhase {
    /// Request written, nothing received yet.
    Sent,
    /// At least one response received.
    Streaming,
}

/// An in-flight command.
#[derive(Debug)]
pub struct PendingCommand {
    pub command_line: String,
    pub phase: CommandPhase,
    pub sent_at: Instant,
    sink: mpsc::UnboundedSender<CommandEvent>,
    finished: CancellationToken,
}

impl PendingCommand {
    fn finish(self, outcome: CommandOutcome) {
        // The caller may have dropped its stream; that is fine.
        let _ = self.sink.send(CommandEvent::Finished(outcome));
        self.finished.cancel();
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }
}

/// Result of routing a `CommandResponse` to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Chunks forwarded; the command is still running.
    Delivered,
    /// The response ended the command.
    Finished(CommandOutcome),
    /// No pending command has this id (late or stale reply).
    Stale,
}

/// A command that was still pending when the table was drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub id: CorrelationId,
    pub command_line: String,
    pub elapsed: Duration,
}

// ── PendingTable ─────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<Table>,
}

#[derive(Debug, Default)]
struct Table {
    commands: HashMap<CorrelationId, PendingCommand>,
    closed: bool,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new command.
    ///
    /// Returns the caller's stream and a token cancelled once the command
    /// reaches its terminal outcome. Fails with `ConnectionClosed` after
    /// [`drain`](Self::drain).
    pub fn register(
        &self,
        id: CorrelationId,
        command_line: impl Into<String>,
    ) -> Result<(CommandStream, CancellationToken), PmxError> {
        let mut table = self.lock();
        if table.closed {
            return Err(PmxError::ConnectionClosed);
        }
        let commands = &mut table.commands;
        if commands.contains_key(&id) {
            return Err(PmxError::DuplicateRequest(id));
        }
        let (sink, rx) = mpsc::unbounded_channel();
        let finished = CancellationToken::new();
        commands.insert(
            id,
            PendingCommand {
                command_line: command_line.into(),
                phase: CommandPhase::Sent,
                sent_at: Instant::now(),
                sink,
                finished: finished.clone(),
            },
        );
        Ok((CommandStream::new(id, rx), finished))
    }

    /// Route one `CommandResponse`.
    pub fn deliver(
        &self,
        id: CorrelationId,
        chunks: Vec<String>,
        status: ResponseStatus,
    ) -> Delivery {
        let mut table = self.lock();
        let commands = &mut table.commands;
        let Some(command) = commands.get_mut(&id) else {
            debug!(%id, "discarding response for unknown command");
            return Delivery::Stale;
        };

        command.phase = CommandPhase::Streaming;
        for chunk in chunks {
            let _ = command.sink.send(CommandEvent::Chunk(chunk));
        }

        let outcome = match status {
            ResponseStatus::Streaming => return Delivery::Delivered,
            ResponseStatus::Completed => CommandOutcome::Completed,
            ResponseStatus::Cancelled => CommandOutcome::Cancelled(CancelReason::Remote),
            ResponseStatus::Faulted(msg) => CommandOutcome::Faulted(msg),
        };
        if let Some(command) = commands.remove(&id) {
            command.finish(outcome.clone());
        }
        Delivery::Finished(outcome)
    }

    /// Complete a command with `outcome`.
    ///
    /// Returns `false` if it had already finished.
    pub fn resolve(&self, id: CorrelationId, outcome: CommandOutcome) -> bool {
        let removed = self.lock().commands.remove(&id);
        match removed {
            Some(command) => {
                command.finish(outcome);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending command with `ConnectionLost(reason)` and close
    /// the table.
    pub fn drain(&self, reason: &str) -> Vec<InFlight> {
        let drained: Vec<_> = {
            let mut table = self.lock();
            table.closed = true;
            table.commands.drain().collect()
        };
        let mut in_flight = Vec::with_capacity(drained.len());
        for (id, command) in drained {
            in_flight.push(InFlight {
                id,
                command_line: command.command_line.clone(),
                elapsed: command.elapsed(),
            });
            command.finish(CommandOutcome::Cancelled(CancelReason::ConnectionLost(
                reason.to_string(),
            )));
        }
        in_flight
    }

    pub fn len(&self) -> usize {
        self.lock().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn phase(&self, id: CorrelationId) -> Option<CommandPhase> {
        self.lock().commands.get(&id).map(|c| c.phase)
    }
}

// ── Tests ─────────────────────────────────────────────────────────
