//! Protocol message model.
//!
//! Every frame carries a [`MessageKind`] discriminator in its header; the
//! payload is the `bincode` body of that variant. Unknown discriminators are
//! rejected, never guessed from payload shape.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PmxError;
use crate::flags::ProtocolFlags;
use crate::header::FrameHeader;
use crate::log::LogRecord;

// ── CorrelationId ────────────────────────────────────────────────

/// Opaque 128-bit token linking a request to its response(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// A fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero identifier used by uncorrelated pushes.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CorrelationId {
    type Err = PmxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| PmxError::Other(format!("invalid correlation id '{s}': {e}")))
    }
}

// ── MessageKind ──────────────────────────────────────────────────

/// Wire discriminator for every message variant.
///
/// - `0x00xx` client requests
/// - `0x008x` correlated server responses
/// - `0x009x` unsolicited server pushes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ConnectRequest = 0x01,
    CommandRequest = 0x02,
    CancelRequest = 0x03,
    DisconnectRequest = 0x04,

    ConnectResponse = 0x81,
    CommandResponse = 0x82,
    ErrorResponse = 0x83,

    LogResponse = 0x90,
    DisconnectResponse = 0x91,
}

impl TryFrom<u16> for MessageKind {
    type Error = PmxError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageKind::ConnectRequest),
            0x02 => Ok(MessageKind::CommandRequest),
            0x03 => Ok(MessageKind::CancelRequest),
            0x04 => Ok(MessageKind::DisconnectRequest),

            0x81 => Ok(MessageKind::ConnectResponse),
            0x82 => Ok(MessageKind::CommandResponse),
            0x83 => Ok(MessageKind::ErrorResponse),

            0x90 => Ok(MessageKind::LogResponse),
            0x91 => Ok(MessageKind::DisconnectResponse),

            _ => Err(PmxError::Protocol(format!(
                "unknown message discriminator {value:#06x}"
            ))),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl MessageKind {
    /// Client-to-server requests.
    pub fn is_request(self) -> bool {
        (self as u16) < 0x80
    }
}

// ── Response status ──────────────────────────────────────────────

/// Stream position of a `CommandResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    /// More responses follow for this id.
    Streaming,
    /// The command finished successfully.
    Completed,
    /// The command was cancelled before finishing.
    Cancelled,
    /// The handler failed.
    Faulted(String),
}

impl ResponseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseStatus::Streaming)
    }

    fn flags(&self) -> ProtocolFlags {
        match self {
            ResponseStatus::Streaming => ProtocolFlags::NONE,
            ResponseStatus::Completed => ProtocolFlags::FINAL,
            ResponseStatus::Cancelled => ProtocolFlags::FINAL | ProtocolFlags::CANCELLED,
            ResponseStatus::Faulted(_) => ProtocolFlags::FINAL | ProtocolFlags::FAULTED,
        }
    }

    fn from_wire(flags: ProtocolFlags, error: Option<String>) -> Self {
        if !flags.is_final() {
            ResponseStatus::Streaming
        } else if flags.contains(ProtocolFlags::CANCELLED) {
            ResponseStatus::Cancelled
        } else if flags.contains(ProtocolFlags::FAULTED) {
            ResponseStatus::Faulted(error.unwrap_or_default())
        } else {
            ResponseStatus::Completed
        }
    }
}

/// Why the server rejected a request outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectKind {
    /// The correlation id is already in use by an active command.
    DuplicateRequest,
    /// The request is not legal in the server session's current state.
    InvalidState,
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Message ──────────────────────────────────────────────────────

/// A single protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ConnectRequest {
        id: CorrelationId,
        description: String,
    },
    CommandRequest {
        id: CorrelationId,
        command_line: String,
    },
    /// Best-effort request to cancel the command `target`.
    CancelRequest {
        id: CorrelationId,
        target: CorrelationId,
    },
    DisconnectRequest {
        id: CorrelationId,
    },
    ConnectResponse {
        id: CorrelationId,
    },
    CommandResponse {
        id: CorrelationId,
        chunks: Vec<String>,
        status: ResponseStatus,
    },
    ErrorResponse {
        id: CorrelationId,
        kind: RejectKind,
        message: String,
    },
    LogResponse {
        log: LogRecord,
    },
    DisconnectResponse {
        reason: String,
    },
}

// Wire bodies. Variants without fields travel with an empty payload.

#[derive(Serialize, Deserialize)]
struct ConnectRequestBody {
    description: String,
}

#[derive(Serialize, Deserialize)]
struct CommandRequestBody {
    command_line: String,
}

#[derive(Serialize, Deserialize)]
struct CancelRequestBody {
    target: CorrelationId,
}

#[derive(Serialize, Deserialize)]
struct CommandResponseBody {
    chunks: Vec<String>,
    error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ErrorResponseBody {
    kind: RejectKind,
    message: String,
}

#[derive(Serialize, Deserialize)]
struct DisconnectResponseBody {
    reason: String,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ConnectRequest { .. } => MessageKind::ConnectRequest,
            Message::CommandRequest { .. } => MessageKind::CommandRequest,
            Message::CancelRequest { .. } => MessageKind::CancelRequest,
            Message::DisconnectRequest { .. } => MessageKind::DisconnectRequest,
            Message::ConnectResponse { .. } => MessageKind::ConnectResponse,
            Message::CommandResponse { .. } => MessageKind::CommandResponse,
            Message::ErrorResponse { .. } => MessageKind::ErrorResponse,
            Message::LogResponse { .. } => MessageKind::LogResponse,
            Message::DisconnectResponse { .. } => MessageKind::DisconnectResponse,
        }
    }

    /// The correlation id, or `None` for unsolicited pushes.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Message::ConnectRequest { id, .. }
            | Message::CommandRequest { id, .. }
            | Message::CancelRequest { id, .. }
            | Message::DisconnectRequest { id }
            | Message::ConnectResponse { id }
            | Message::CommandResponse { id, .. }
            | Message::ErrorResponse { id, .. } => Some(*id),
            Message::LogResponse { .. } | Message::DisconnectResponse { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind().is_request()
    }

    /// `true` for a `CommandResponse` that ends its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::CommandResponse { status, .. } if status.is_terminal())
    }

    /// Serialize into a header and payload pair.
    pub fn encode(&self) -> Result<(FrameHeader, Vec<u8>), PmxError> {
        let (flags, payload) = match self {
            Message::ConnectRequest { description, .. } => (
                ProtocolFlags::NONE,
                bincode::serialize(&ConnectRequestBody {
                    description: description.clone(),
                })?,
            ),
            Message::CommandRequest { command_line, .. } => (
                ProtocolFlags::NONE,
                bincode::serialize(&CommandRequestBody {
                    command_line: command_line.clone(),
                })?,
            ),
            Message::CancelRequest { target, .. } => (
                ProtocolFlags::NONE,
                bincode::serialize(&CancelRequestBody { target: *target })?,
            ),
            Message::DisconnectRequest { .. } | Message::ConnectResponse { .. } => {
                (ProtocolFlags::NONE, Vec::new())
            }
            Message::CommandResponse { chunks, status, .. } => {
                let error = match status {
                    ResponseStatus::Faulted(msg) => Some(msg.clone()),
                    _ => None,
                };
                let body = CommandResponseBody {
                    chunks: chunks.clone(),
                    error,
                };
                (status.flags(), bincode::serialize(&body)?)
            }
            Message::ErrorResponse { kind, message, .. } => (
                ProtocolFlags::NONE,
                bincode::serialize(&ErrorResponseBody {
                    kind: *kind,
                    message: message.clone(),
                })?,
            ),
            Message::LogResponse { log } => (ProtocolFlags::NONE, bincode::serialize(log)?),
            Message::DisconnectResponse { reason } => (
                ProtocolFlags::NONE,
                bincode::serialize(&DisconnectResponseBody {
                    reason: reason.clone(),
                })?,
            ),
        };

        let id = self.correlation_id().unwrap_or_else(CorrelationId::nil);
        let header = FrameHeader::for_payload(self.kind() as u16, flags, id, &payload)?;
        Ok((header, payload))
    }

    /// Rebuild a message from a verified header and its payload.
    pub fn decode(header: &FrameHeader, payload: &[u8]) -> Result<Self, PmxError> {
        let kind = MessageKind::try_from(header.kind)?;
        let id = header.correlation_id;

        let message = match kind {
            MessageKind::ConnectRequest => {
                let body: ConnectRequestBody = body(payload)?;
                Message::ConnectRequest {
                    id,
                    description: body.description,
                }
            }
            MessageKind::CommandRequest => {
                let body: CommandRequestBody = body(payload)?;
                Message::CommandRequest {
                    id,
                    command_line: body.command_line,
                }
            }
            MessageKind::CancelRequest => {
                let body: CancelRequestBody = body(payload)?;
                Message::CancelRequest {
                    id,
                    target: body.target,
                }
            }
            MessageKind::DisconnectRequest => Message::DisconnectRequest { id },
            MessageKind::ConnectResponse => Message::ConnectResponse { id },
            MessageKind::CommandResponse => {
                let body: CommandResponseBody = body(payload)?;
                Message::CommandResponse {
                    id,
                    chunks: body.chunks,
                    status: ResponseStatus::from_wire(header.flags, body.error),
                }
            }
            MessageKind::ErrorResponse => {
                let body: ErrorResponseBody = body(payload)?;
                Message::ErrorResponse {
                    id,
                    kind: body.kind,
                    message: body.message,
                }
            }
            MessageKind::LogResponse => Message::LogResponse { log: body(payload)? },
            MessageKind::DisconnectResponse => {
                let body: DisconnectResponseBody = body(payload)?;
                Message::DisconnectResponse {
                    reason: body.reason,
                }
            }
        };
        Ok(message)
    }
}

fn body<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, PmxError> {
    bincode::deserialize(payload)
        .map_err(|e| PmxError::Protocol(format!("undecodable message body: {e}")))
}
