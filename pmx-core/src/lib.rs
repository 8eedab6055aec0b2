//! # pmx-core
//!
//! Core library for PMX, a request/response protocol spoken over local
//! named pipes between a management console and a long-running host.
//!
//! This crate contains:
//! - **Wire format**: `FrameHeader`, `ProtocolFlags` and the `PmxCodec` used
//!   with `tokio_util` framing
//! - **Messages**: the closed `Message` set, correlated by `CorrelationId`
//! - **Network**: pipe naming/discovery, platform streams, framed halves
//! - **State**: the pipe lifecycle machine and the client's pending table
//! - **Dispatch**: server-side command handlers with cancellation
//! - **Server / Client**: the two session endpoints
//! - **Error**: `PmxError`, a `thiserror`-based error hierarchy

pub mod client;
pub mod codec;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod flags;
pub mod header;
pub mod log;
pub mod message;
pub mod network;
pub mod server;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client::{ConnectOptions, PipeClient, PushEvent};
pub use codec::PmxCodec;
pub use command::{CancelReason, CommandEvent, CommandOutcome, CommandStream};
pub use dispatch::{ChunkSink, CommandHandler, Dispatcher, HandlerRegistry};
pub use error::{HandlerError, PmxError};
pub use flags::ProtocolFlags;
pub use header::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use log::{LogLevel, LogRecord, LogSource, MemoryLogStore};
pub use message::{CorrelationId, Message, MessageKind, RejectKind, ResponseStatus};
pub use network::{Endpoint, PipeListener, PipeReader, PipeWriter};
pub use server::{PipeServer, ServerOptions};
pub use state::{PendingTable, PipeState, PipeStateMachine};
