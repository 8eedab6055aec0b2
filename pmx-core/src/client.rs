//! Client session facade used by the console.
//!
//! A [`PipeClient`] owns one connection: a reader loop that routes every
//! incoming frame, a shared writer, the pending-command table and the pipe
//! state machine. Commands are issued with [`PipeClient::execute`] and
//! observed through their [`CommandStream`]; server pushes arrive on
//! [`PipeClient::events`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{CancelReason, CommandOutcome, CommandStream};
use crate::error::PmxError;
use crate::log::LogRecord;
use crate::message::{CorrelationId, Message, MessageKind, RejectKind};
use crate::network::{
    Endpoint, PipeReader, PipeStream, PipeWriter, default_pipe_dir, discover, open, select,
    split_pipe,
};
use crate::state::{Delivery, PendingTable, PipeState, PipeStateMachine};

/// How long `disconnect` waits for the server's `DisconnectResponse`.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 1024;

/// Parameters for [`PipeClient::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Sent to the server in the `ConnectRequest`.
    pub description: String,
    /// Service name, pipe name or path. `None` picks the first pipe that
    /// accepts a connection.
    pub endpoint: Option<String>,
    /// Bound on opening the pipe plus the handshake.
    pub timeout: Duration,
    /// Where to look for pipes; defaults to the platform pipe directory.
    pub pipe_dir: Option<PathBuf>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            description: "pmx-console".to_string(),
            endpoint: None,
            timeout: Duration::from_secs(5),
            pipe_dir: None,
        }
    }
}

/// Unsolicited server notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Log(LogRecord),
    /// The connection is gone. Sent once, whatever the cause.
    Disconnected(String),
}

// ── Shared connection state ──────────────────────────────────────

#[derive(Debug)]
struct Shared {
    state: PipeStateMachine,
    pending: PendingTable,
    events: broadcast::Sender<PushEvent>,
}

impl Shared {
    /// Route one frame. Returns the close reason when the server ended the
    /// connection.
    fn route(&self, message: Message) -> Option<String> {
        match message {
            Message::CommandResponse { id, chunks, status } => {
                match self.pending.deliver(id, chunks, status) {
                    Delivery::Finished(outcome) => debug!(%id, %outcome, "command finished"),
                    Delivery::Delivered | Delivery::Stale => {}
                }
            }
            Message::ErrorResponse {
                id,
                kind: RejectKind::DuplicateRequest,
                message,
            } => {
                // The original command with this id is still running.
                warn!(%id, "server rejected duplicate request: {message}");
            }
            Message::ErrorResponse { id, kind, message } => {
                if !self.pending.resolve(id, CommandOutcome::Faulted(message.clone())) {
                    warn!(%id, %kind, "server rejected request: {message}");
                }
            }
            Message::LogResponse { log } => {
                let _ = self.events.send(PushEvent::Log(log));
            }
            Message::DisconnectResponse { reason } => return Some(reason),
            Message::ConnectResponse { id } => debug!(%id, "ignoring repeated ConnectResponse"),
            request => warn!(kind = %request.kind(), "ignoring request sent by server"),
        }
        None
    }

    /// Close the connection and fail every command still in flight.
    fn shutdown(&self, reason: &str) {
        if self.state.close() {
            info!(%reason, "connection closed");
            let _ = self.events.send(PushEvent::Disconnected(reason.to_string()));
        }
        for lost in self.pending.drain(reason) {
            warn!(
                id = %lost.id,
                command = %lost.command_line,
                elapsed = ?lost.elapsed,
                "command was in flight when the connection closed"
            );
        }
    }
}

// ── PipeClient ───────────────────────────────────────────────────

pub struct PipeClient {
    endpoint: Option<Endpoint>,
    writer: PipeWriter,
    shared: Arc<Shared>,
    first_events: Mutex<Option<broadcast::Receiver<PushEvent>>>,
    /// Asks the reader loop to stop.
    stop: CancellationToken,
    /// Cancelled once the reader loop has finished.
    reader_done: CancellationToken,
}

impl PipeClient {
    /// Discover, open and handshake.
    pub async fn connect(
        options: ConnectOptions,
        token: CancellationToken,
    ) -> Result<Self, PmxError> {
        let dir = options.pipe_dir.clone().unwrap_or_else(default_pipe_dir);
        let candidates = match options.endpoint.as_deref() {
            Some(wanted) => match Endpoint::from_reference(wanted, &dir) {
                Some(direct) => vec![direct],
                None => select(discover(&dir), Some(wanted)),
            },
            None => discover(&dir),
        };
        if candidates.is_empty() {
            return Err(PmxError::PipeUnavailable(match options.endpoint {
                Some(wanted) => format!("no pipe named '{wanted}' in {}", dir.display()),
                None => format!("no pipes found in {}", dir.display()),
            }));
        }

        let deadline = Instant::now() + options.timeout;
        let mut last_error = None;
        for endpoint in candidates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PmxError::ConnectTimeout(options.timeout));
            }
            let opened = tokio::select! {
                _ = token.cancelled() => return Err(PmxError::Cancelled),
                opened = open(&endpoint, remaining) => opened,
            };
            match opened {
                Ok(stream) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let mut client =
                        Self::handshake(stream, &options.description, remaining, token).await;
                    if let Ok(client) = client.as_mut() {
                        client.endpoint = Some(endpoint.clone());
                        info!(pipe = %endpoint.pipe_name(), "connected");
                    }
                    return client.map_err(|e| match e {
                        PmxError::ConnectTimeout(_) => PmxError::ConnectTimeout(options.timeout),
                        other => other,
                    });
                }
                Err(PmxError::PipeUnavailable(msg)) => {
                    debug!(pipe = %endpoint.pipe_name(), "skipping: {msg}");
                    last_error = Some(PmxError::PipeUnavailable(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| PmxError::PipeUnavailable("no pipe accepted".into())))
    }

    /// Handshake over an already-open stream.
    pub async fn from_stream<S: PipeStream>(
        stream: S,
        description: &str,
        timeout: Duration,
        token: CancellationToken,
    ) -> Result<Self, PmxError> {
        Self::handshake(stream, description, timeout, token).await
    }

    async fn handshake<S: PipeStream>(
        stream: S,
        description: &str,
        timeout: Duration,
        token: CancellationToken,
    ) -> Result<Self, PmxError> {
        let (events, first_events) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            state: PipeStateMachine::new(),
            pending: PendingTable::new(),
            events,
        });
        let (mut reader, writer) = split_pipe(stream);
        shared.state.mark_open()?;
        shared.state.await_connect()?;

        let id = CorrelationId::new();
        let hello = Message::ConnectRequest {
            id,
            description: description.to_string(),
        };
        let exchange = async {
            writer.send(hello).await?;
            await_connect_response(&mut reader, id).await
        };
        let result = tokio::select! {
            _ = token.cancelled() => Err(PmxError::Cancelled),
            done = tokio::time::timeout(timeout, exchange) => match done {
                Ok(result) => result,
                Err(_) => Err(PmxError::ConnectTimeout(timeout)),
            },
        };
        if let Err(e) = result {
            shared.state.close();
            writer.shutdown().await;
            return Err(e);
        }
        shared.state.mark_connected()?;

        let stop = CancellationToken::new();
        let reader_done = CancellationToken::new();
        tokio::spawn(read_loop(
            reader,
            writer.clone(),
            Arc::clone(&shared),
            stop.clone(),
            reader_done.clone(),
        ));

        Ok(Self {
            endpoint: None,
            writer,
            shared,
            first_events: Mutex::new(Some(first_events)),
            stop,
            reader_done,
        })
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Send `command_line` and return its output stream.
    ///
    /// Fails without touching the pipe unless the connection is
    /// `Connected`. Cancelling `token` finishes the stream as
    /// `Cancelled(Local)` at once and asks the server to stop the command.
    pub async fn execute(
        &self,
        command_line: impl Into<String>,
        token: CancellationToken,
    ) -> Result<(CorrelationId, CommandStream), PmxError> {
        self.shared.state.check_request(MessageKind::CommandRequest)?;
        if token.is_cancelled() {
            return Err(PmxError::Cancelled);
        }

        let command_line = command_line.into();
        let id = CorrelationId::new();
        // Refused once the table is drained, so a close racing this call
        // cannot strand the command.
        let (stream, finished) = self.shared.pending.register(id, command_line.clone())?;
        debug!(%id, command = %command_line, "sending command");
        let sent = self
            .writer
            .send(Message::CommandRequest { id, command_line })
            .await;
        if let Err(e) = self.check_write(sent) {
            self.shared.pending.resolve(
                id,
                CommandOutcome::Cancelled(CancelReason::ConnectionLost(e.to_string())),
            );
            return Err(e);
        }

        let shared = Arc::clone(&self.shared);
        let writer = self.writer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = finished.cancelled() => {}
                _ = token.cancelled() => {
                    if !shared.pending.resolve(id, CommandOutcome::Cancelled(CancelReason::Local)) {
                        return;
                    }
                    debug!(%id, "command cancelled locally");
                    if shared.state.check_request(MessageKind::CancelRequest).is_ok() {
                        let cancel = Message::CancelRequest { id: CorrelationId::new(), target: id };
                        if let Err(e) = writer.send(cancel).await {
                            debug!(%id, "cancel request not sent: {e}");
                        }
                    }
                }
            }
        });

        Ok((id, stream))
    }

    /// Ask the server to cancel `target`. Returns once the request is
    /// flushed; the command's own stream reports the outcome.
    pub async fn cancel_command(
        &self,
        target: CorrelationId,
        token: CancellationToken,
    ) -> Result<(), PmxError> {
        self.shared.state.check_request(MessageKind::CancelRequest)?;
        let request = Message::CancelRequest {
            id: CorrelationId::new(),
            target,
        };
        tokio::select! {
            _ = token.cancelled() => Err(PmxError::Cancelled),
            sent = self.writer.send(request) => self.check_write(sent),
        }
    }

    /// Tear the connection down when `sent` failed on the pipe itself.
    fn check_write(&self, sent: Result<(), PmxError>) -> Result<(), PmxError> {
        if sent.is_err() {
            if let Some(reason) = self.writer.failure_reason() {
                self.shared.shutdown(&reason);
                self.stop.cancel();
            }
        }
        sent
    }

    // ── Connection ───────────────────────────────────────────────

    /// Politely end the session. Commands still pending finish as
    /// `Cancelled(ConnectionLost)`. Calling it on a closed client is a no-op.
    pub async fn disconnect(&self) -> Result<(), PmxError> {
        if self.shared.state.current().is_closed() {
            return Ok(());
        }
        self.shared.state.check_request(MessageKind::DisconnectRequest)?;
        let request = Message::DisconnectRequest {
            id: CorrelationId::new(),
        };
        let sent = self.writer.send(request).await;
        if self.check_write(sent).is_ok() {
            let _ = tokio::time::timeout(DISCONNECT_GRACE, self.reader_done.cancelled()).await;
        }
        self.shared.shutdown("disconnected by client");
        self.stop.cancel();
        Ok(())
    }

    /// Server pushes. The first call also sees everything pushed since
    /// the handshake.
    pub fn events(&self) -> broadcast::Receiver<PushEvent> {
        let first = self
            .first_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        first.unwrap_or_else(|| self.shared.events.subscribe())
    }

    pub fn state(&self) -> PipeState {
        self.shared.state.current()
    }

    /// Watch the connection state.
    ///
    /// A client only exists once the handshake has succeeded, so the first
    /// value seen is `Connected`; the only change that can follow is
    /// `Closed`.
    pub fn state_changes(&self) -> watch::Receiver<PipeState> {
        self.shared.state.subscribe()
    }

    /// The pipe this client was connected through, when known.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for PipeClient {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for PipeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

async fn await_connect_response(
    reader: &mut PipeReader,
    id: CorrelationId,
) -> Result<(), PmxError> {
    loop {
        match reader.next().await {
            None => {
                return Err(PmxError::ConnectionLost(
                    "pipe closed during handshake".into(),
                ));
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(Message::ConnectResponse { id: got })) if got == id => return Ok(()),
            Some(Ok(Message::ErrorResponse { id: got, message, .. })) if got == id => {
                return Err(PmxError::ConnectionLost(format!(
                    "handshake rejected: {message}"
                )));
            }
            Some(Ok(Message::DisconnectResponse { reason })) => {
                return Err(PmxError::ConnectionLost(reason));
            }
            Some(Ok(other)) => debug!(kind = %other.kind(), "ignoring message before handshake"),
        }
    }
}

async fn read_loop(
    mut reader: PipeReader,
    writer: PipeWriter,
    shared: Arc<Shared>,
    stop: CancellationToken,
    done: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break "client dropped".to_string(),
            reason = writer.failed() => {
                warn!("connection failed: {reason}");
                break reason;
            }
            frame = reader.next() => frame,
        };
        match frame {
            None => break "pipe closed by server".to_string(),
            Some(Err(e)) => {
                warn!("connection failed: {e}");
                break e.to_string();
            }
            Some(Ok(message)) => {
                if let Some(reason) = shared.route(message) {
                    break reason;
                }
            }
        }
    };
    shared.shutdown(&reason);
    writer.shutdown().await;
    done.cancel();
}

// ── Tests ────────────────────────────────────────────────────────
