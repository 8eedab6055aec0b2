//! Pipe connection lifecycle shared by client and server endpoints.
//!
//! ```text
//!  Starting ──► Open ──► AwaitingConnect ──► Connected
//!     │          │              │                │
//!     └──────────┴──────────────┴────────────────┴──► Closed
//! ```
//!
//! `Closed` is terminal. Transitions are published on a `watch` channel so
//! the console can react to `Connected` / `Closed`.

use std::fmt;

use tokio::sync::watch;

use crate::error::PmxError;
use crate::message::MessageKind;

/// The current phase of a pipe connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipeState {
    /// Transport not yet opened.
    #[default]
    Starting,
    /// The pipe is open.
    Open,
    /// Readable and writable; handshake not yet answered.
    AwaitingConnect,
    /// Handshake complete; commands may flow.
    Connected,
    /// Torn down. Never left.
    Closed,
}

impl fmt::Display for PipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl PipeState {
    pub fn is_connected(self) -> bool {
        matches!(self, PipeState::Connected)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, PipeState::Closed)
    }
}

// ── PipeStateMachine ─────────────────────────────────────────────

/// Observable, validated [`PipeState`] holder.
#[derive(Debug)]
pub struct PipeStateMachine {
    tx: watch::Sender<PipeState>,
}

impl PipeStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PipeState::Starting);
        Self { tx }
    }

    pub fn current(&self) -> PipeState {
        *self.tx.borrow()
    }

    /// Receive every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<PipeState> {
        self.tx.subscribe()
    }

    // ── Transitions ──────────────────────────────────────────────

    /// `Starting → Open`.
    pub fn mark_open(&self) -> Result<(), PmxError> {
        self.transition(PipeState::Starting, PipeState::Open, "open the pipe")
    }

    /// `Open → AwaitingConnect`.
    pub fn await_connect(&self) -> Result<(), PmxError> {
        self.transition(
            PipeState::Open,
            PipeState::AwaitingConnect,
            "start the handshake",
        )
    }

    /// `AwaitingConnect → Connected`.
    pub fn mark_connected(&self) -> Result<(), PmxError> {
        self.transition(
            PipeState::AwaitingConnect,
            PipeState::Connected,
            "complete the handshake",
        )
    }

    /// Any state → `Closed`.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = PipeState::Closed;
                true
            }
        })
    }

    fn transition(
        &self,
        from: PipeState,
        to: PipeState,
        operation: &'static str,
    ) -> Result<(), PmxError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                result = Err(match *state {
                    PipeState::Closed => PmxError::ConnectionClosed,
                    other => PmxError::InvalidState {
                        state: other,
                        operation,
                    },
                });
                false
            }
        });
        result
    }

    // ── Gating ───────────────────────────────────────────────────

    /// Whether a request of `kind` may be sent (or accepted) right now.
    ///
    /// While `AwaitingConnect` only the `ConnectRequest` is legal; once
    /// `Connected` every request except a second `ConnectRequest` is.
    pub fn check_request(&self, kind: MessageKind) -> Result<(), PmxError> {
        match (self.current(), kind) {
            (PipeState::Closed, _) => Err(PmxError::ConnectionClosed),
            (PipeState::AwaitingConnect, MessageKind::ConnectRequest) => Ok(()),
            (PipeState::Connected, k) if k != MessageKind::ConnectRequest => Ok(()),
            (state, k) => Err(PmxError::InvalidState {
                state,
                operation: send_operation(k),
            }),
        }
    }
}

impl Default for PipeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn send_operation(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::ConnectRequest => "send ConnectRequest",
        MessageKind::CommandRequest => "send CommandRequest",
        MessageKind::CancelRequest => "send CancelRequest",
        MessageKind::DisconnectRequest => "send DisconnectRequest",
        _ => "send a response",
    }
}

// ── Tests ────────────────────────────────────────────────────────
