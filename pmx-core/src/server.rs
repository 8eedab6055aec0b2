//! Server endpoint: accepts console connections on a pipe and runs one
//! session per connection.
//!
//! A session answers the handshake, hands `CommandRequest`s to its
//! [`Dispatcher`], honours `CancelRequest`s and pushes host log records to
//! the client once it is connected.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, HandlerRegistry};
use crate::error::PmxError;
use crate::log::{LogRecord, LogSource};
use crate::message::{CorrelationId, Message, RejectKind};
use crate::network::{Endpoint, PipeListener, PipeStream, PipeWriter, split_pipe};
use crate::state::PipeStateMachine;

/// Reason sent to every client when the host stops.
pub const SHUTDOWN_REASON: &str = "server shutting down";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Records newer than this are replayed to a client right after it
    /// connects.
    pub log_backlog: Duration,
    /// Push host log records to connected clients at all.
    pub push_logs: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            log_backlog: Duration::from_secs(300),
            push_logs: true,
        }
    }
}

// ── PipeServer ───────────────────────────────────────────────────

pub struct PipeServer {
    endpoint: Endpoint,
    registry: Arc<HandlerRegistry>,
    logs: Arc<dyn LogSource>,
    options: ServerOptions,
}

impl PipeServer {
    pub fn new(
        endpoint: Endpoint,
        registry: HandlerRegistry,
        logs: Arc<dyn LogSource>,
        options: ServerOptions,
    ) -> Self {
        Self {
            endpoint,
            registry: Arc::new(registry),
            logs,
            options,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accept connections until `shutdown` fires, then tell every client
    /// and wait for their sessions to wind down.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<(), PmxError> {
        let mut listener = PipeListener::bind(self.endpoint.clone())?;
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        let session = self.session();
                        let shutdown = shutdown.clone();
                        sessions.spawn(async move { session.run(stream, shutdown).await });
                        debug!(sessions = sessions.len(), "client accepted");
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        info!(sessions = sessions.len(), "shutting down");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }

    /// Run a single session over an already-connected stream.
    pub async fn serve_stream<S: PipeStream>(&self, stream: S, shutdown: CancellationToken) {
        self.session().run(stream, shutdown).await;
    }

    fn session(&self) -> ServerSession {
        ServerSession {
            registry: Arc::clone(&self.registry),
            logs: Arc::clone(&self.logs),
            options: self.options.clone(),
        }
    }
}

// ── ServerSession ────────────────────────────────────────────────

enum Flow {
    Continue,
    Close(String),
}

struct ServerSession {
    registry: Arc<HandlerRegistry>,
    logs: Arc<dyn LogSource>,
    options: ServerOptions,
}

impl ServerSession {
    async fn run<S: PipeStream>(self, stream: S, shutdown: CancellationToken) {
        let (mut reader, writer) = split_pipe(stream);
        let state = PipeStateMachine::new();
        // Fresh machine: these cannot fail.
        let _ = state.mark_open();
        let _ = state.await_connect();

        let connection = CancellationToken::new();
        let dispatcher = Dispatcher::new(Arc::clone(&self.registry));

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = writer
                        .send(Message::DisconnectResponse { reason: SHUTDOWN_REASON.into() })
                        .await;
                    break SHUTDOWN_REASON.to_string();
                }
                // A handler, a terminal response or the log push hit a dead pipe.
                reason = writer.failed() => {
                    warn!("dropping client: {reason}");
                    break reason;
                }
                frame = reader.next() => match frame {
                    None => break "client closed the pipe".to_string(),
                    Some(Err(e)) => {
                        warn!("dropping client: {e}");
                        break e.to_string();
                    }
                    Some(Ok(message)) => {
                        match self.handle(message, &state, &dispatcher, &writer, &connection).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Close(reason)) => break reason,
                            Err(e) => break e.to_string(),
                        }
                    }
                },
            }
        };

        state.close();
        let running = dispatcher.active_count();
        connection.cancel();
        writer.shutdown().await;
        info!(%reason, cancelled = running, "session closed");
    }

    async fn handle(
        &self,
        message: Message,
        state: &PipeStateMachine,
        dispatcher: &Dispatcher,
        writer: &PipeWriter,
        connection: &CancellationToken,
    ) -> Result<Flow, PmxError> {
        let kind = message.kind();
        if !kind.is_request() {
            warn!(%kind, "ignoring non-request message from client");
            return Ok(Flow::Continue);
        }

        let id = message.correlation_id().unwrap_or_else(CorrelationId::nil);
        if let Err(e) = state.check_request(kind) {
            debug!(%id, %kind, state = %state.current(), "rejecting request");
            reject(writer, id, RejectKind::InvalidState, e.to_string()).await?;
            return Ok(Flow::Continue);
        }

        match message {
            Message::ConnectRequest { id, description } => {
                state.mark_connected()?;
                writer.send(Message::ConnectResponse { id }).await?;
                info!(client = %description, "client connected");
                if self.options.push_logs {
                    tokio::spawn(push_logs(
                        Arc::clone(&self.logs),
                        self.options.log_backlog,
                        writer.clone(),
                        connection.clone(),
                    ));
                }
            }
            Message::CommandRequest { id, command_line } => {
                debug!(%id, command = %command_line, "command requested");
                if let Err(e) = dispatcher.dispatch(id, command_line, writer.clone(), connection) {
                    warn!(%id, "{e}");
                    reject(writer, id, RejectKind::DuplicateRequest, e.to_string()).await?;
                }
            }
            Message::CancelRequest { target, .. } => {
                if dispatcher.cancel(target) {
                    info!(%target, "cancelling command");
                } else {
                    debug!(%target, "cancel for unknown or finished command ignored");
                }
            }
            Message::DisconnectRequest { .. } => {
                let reason = "client requested disconnect".to_string();
                writer
                    .send(Message::DisconnectResponse {
                        reason: reason.clone(),
                    })
                    .await?;
                return Ok(Flow::Close(reason));
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }
}

async fn reject(
    writer: &PipeWriter,
    id: CorrelationId,
    kind: RejectKind,
    message: String,
) -> Result<(), PmxError> {
    writer
        .send(Message::ErrorResponse { id, kind, message })
        .await
}

/// Replay the recent backlog, then forward live records until the
/// connection goes away.
async fn push_logs(
    logs: Arc<dyn LogSource>,
    backlog: Duration,
    writer: PipeWriter,
    connection: CancellationToken,
) {
    // Subscribe first so nothing recorded during the replay is lost.
    let mut live = logs.subscribe();
    let since = TimeDelta::from_std(backlog)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window));

    let backlog = logs.query(since);
    for record in &backlog {
        let log = record.clone();
        if writer.send(Message::LogResponse { log }).await.is_err() {
            return;
        }
    }
    let mut replayed = Replayed::new(backlog);

    loop {
        let record = tokio::select! {
            _ = connection.cancelled() => return,
            received = live.recv() => match received {
                Ok(record) => record,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "log push fell behind, skipping records");
                    continue;
                }
                Err(RecvError::Closed) => return,
            },
        };
        if replayed.covers(&record) {
            continue;
        }
        if writer.send(Message::LogResponse { log: record }).await.is_err() {
            return;
        }
    }
}

/// Matches the head of the live feed against the tail of the replayed
/// backlog.
///
/// Records produced between `subscribe` and `query` appear in both, in the
/// same order. The first live record not found there ends the overlap.
struct Replayed {
    backlog: Vec<LogRecord>,
    /// Index of the next backlog record the live feed must match.
    next: Option<usize>,
    done: bool,
}

impl Replayed {
    fn new(backlog: Vec<LogRecord>) -> Self {
        let done = backlog.is_empty();
        Self {
            backlog,
            next: None,
            done,
        }
    }

    fn covers(&mut self, record: &LogRecord) -> bool {
        if self.done {
            return false;
        }
        let found = match self.next {
            Some(i) => (self.backlog.get(i) == Some(record)).then_some(i),
            None => self.backlog.iter().rposition(|r| r == record),
        };
        match found {
            Some(i) if i + 1 < self.backlog.len() => self.next = Some(i + 1),
            Some(_) => self.finish(),
            None => {
                self.finish();
                return false;
            }
        }
        true
    }

    fn finish(&mut self) {
        self.done = true;
        self.backlog = Vec::new();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogLevel, LogRecord, MemoryLogStore};
    use crate::network::PipeReader;

    fn server(logs: Arc<MemoryLogStore>, push_logs: bool) -> PipeServer {
        PipeServer::new(
            Endpoint::new("test", "local", std::path::Path::new("/tmp")),
            HandlerRegistry::new(),
            logs,
            ServerOptions {
                log_backlog: Duration::from_secs(60),
                push_logs,
            },
        )
    }

    async fn recv(reader: &mut PipeReader) -> Message {
        tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("valid frame")
    }

    #[tokio::test]
    async fn commands_before_connect_are_rejected() {
        let server = server(Arc::new(MemoryLogStore::default()), false);
        let (client, stream) = tokio::io::duplex(4096);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(async move { server.serve_stream(stream, shutdown).await });

        let (mut reader, writer) = split_pipe(client);
        let id = CorrelationId::new();
        writer
            .send(Message::CommandRequest { id, command_line: "ping".into() })
            .await
            .unwrap();
        match recv(&mut reader).await {
            Message::ErrorResponse { id: got, kind, .. } => {
                assert_eq!(got, id);
                assert_eq!(kind, RejectKind::InvalidState);
            }
            other => panic!("unexpected {other:?}"),
        }

        writer.send(Message::DisconnectRequest { id: CorrelationId::new() }).await.unwrap();
        assert!(matches!(recv(&mut reader).await, Message::ErrorResponse { .. }));
        drop(writer);
        drop(reader);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_backlog_and_disconnect() {
        let logs = Arc::new(MemoryLogStore::default());
        logs.record(LogRecord::new(LogLevel::Info, "host", "booted"));
        let server = server(Arc::clone(&logs), true);
        let (client, stream) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            server.serve_stream(stream, CancellationToken::new()).await
        });

        let (mut reader, writer) = split_pipe(client);
        let id = CorrelationId::new();
        writer
            .send(Message::ConnectRequest { id, description: "test console".into() })
            .await
            .unwrap();
        assert_eq!(recv(&mut reader).await, Message::ConnectResponse { id });
        match recv(&mut reader).await {
            Message::LogResponse { log } => assert_eq!(log.message, "booted"),
            other => panic!("unexpected {other:?}"),
        }

        // A second handshake on the same connection is not allowed.
        writer
            .send(Message::ConnectRequest { id: CorrelationId::new(), description: "again".into() })
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut reader).await,
            Message::ErrorResponse { kind: RejectKind::InvalidState, .. }
        ));

        writer.send(Message::DisconnectRequest { id: CorrelationId::new() }).await.unwrap();
        assert!(matches!(recv(&mut reader).await, Message::DisconnectResponse { .. }));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_notifies_connected_clients() {
        let server = server(Arc::new(MemoryLogStore::default()), false);
        let (client, stream) = tokio::io::duplex(4096);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { server.serve_stream(stream, shutdown).await }
        });

        let (mut reader, writer) = split_pipe(client);
        let id = CorrelationId::new();
        writer
            .send(Message::ConnectRequest { id, description: "c".into() })
            .await
            .unwrap();
        assert_eq!(recv(&mut reader).await, Message::ConnectResponse { id });

        shutdown.cancel();
        assert_eq!(
            recv(&mut reader).await,
            Message::DisconnectResponse { reason: SHUTDOWN_REASON.into() }
        );
        task.await.unwrap();
    }

    fn frame(message: Message) -> Vec<u8> {
        use tokio_util::codec::Encoder;
        let mut buf = bytes::BytesMut::new();
        crate::codec::PmxCodec.encode(message, &mut buf).unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn failed_background_write_ends_the_session() {
        let logs = Arc::new(MemoryLogStore::default());
        logs.record(LogRecord::new(LogLevel::Info, "host", "booted"));
        let server = server(logs, true);

        let id = CorrelationId::new();
        // The backlog push hits a broken pipe while the client stays silent.
        let pipe = tokio_test::io::Builder::new()
            .read(&frame(Message::ConnectRequest { id, description: "c".into() }))
            .write(&frame(Message::ConnectResponse { id }))
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .wait(Duration::from_secs(60))
            .build();

        tokio::time::timeout(
            Duration::from_secs(5),
            server.serve_stream(pipe, CancellationToken::new()),
        )
        .await
        .expect("session ends after the write error");
    }

    #[test]
    fn replay_overlap_is_matched_by_content() {
        let first = LogRecord::new(LogLevel::Info, "host", "one");
        let mut second = LogRecord::new(LogLevel::Info, "host", "two");
        second.timestamp = first.timestamp;
        let mut third = LogRecord::new(LogLevel::Info, "host", "three");
        third.timestamp = first.timestamp;

        let mut replayed = Replayed::new(vec![first.clone(), second.clone()]);
        assert!(replayed.covers(&second));
        // Same timestamp as the replay, but never sent.
        assert!(!replayed.covers(&third));
        assert!(!replayed.covers(&first));

        let mut empty = Replayed::new(Vec::new());
        assert!(!empty.covers(&first));
    }
}
