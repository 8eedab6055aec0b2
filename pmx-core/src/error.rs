//! Domain-specific error types for the PMX protocol.
//!
//! All fallible operations return `Result<T, PmxError>`.
//! Transport-level failures close the connection; per-command failures
//! only fault the originating command stream.

use std::time::Duration;
use thiserror::Error;

use crate::message::CorrelationId;
use crate::state::PipeState;

/// The canonical error type for the PMX protocol.
#[derive(Debug, Error)]
pub enum PmxError {
    // ── Connection Errors ────────────────────────────────────────
    /// The pipe could not be opened or the handshake did not finish in time.
    #[error("connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// No pipe matched, or the pipe refused / does not exist.
    #[error("pipe unavailable: {0}")]
    PipeUnavailable(String),

    /// A message was sent while the connection was not in the required state.
    #[error("invalid state: cannot {operation} while {state}")]
    InvalidState {
        state: PipeState,
        operation: &'static str,
    },

    /// The connection failed (I/O error, protocol error, remote disconnect).
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The connection is already closed; it is never reused.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    // ── Protocol Errors ──────────────────────────────────────────
    /// A frame could not be decoded. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A request reused a correlation identifier that is still pending.
    #[error("duplicate request: {0}")]
    DuplicateRequest(CorrelationId),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Plumbing ─────────────────────────────────────────────────
    /// The pipe/IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding of a payload body failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── HandlerError ──────────────────────────────────────────────────

/// Typed error returned by server-side command handlers.
///
/// A handler error faults only the command that produced it.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The command line could not be interpreted by the handler.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The handler's I/O work failed.
    #[error("handler I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The output stream back to the client is gone.
    #[error("output closed")]
    OutputClosed,

    /// Generic failure with a human-readable message.
    #[error("{0}")]
    Failed(String),
}

// ── Conversions ──────────────────────────────────────────────────

impl From<Box<bincode::ErrorKind>> for PmxError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        PmxError::Encoding(e.to_string())
    }
}
