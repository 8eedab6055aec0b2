//! Server-side command dispatch.
//!
//! Each `CommandRequest` runs in its own task under a child of the
//! connection's cancellation token. Output is streamed through a
//! [`ChunkSink`] as it is produced and every command ends with exactly one
//! terminal `CommandResponse`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HandlerError, PmxError};
use crate::message::{CorrelationId, Message, ResponseStatus};
use crate::network::PipeWriter;

// ── CommandHandler ───────────────────────────────────────────────

/// A command the host knows how to run.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// First word of the command line that selects this handler.
    fn name(&self) -> &str;

    /// One-line description shown by `help`.
    fn summary(&self) -> &str {
        ""
    }

    /// Run with everything after the command word in `args`.
    ///
    /// Long-running handlers should watch `cancel`; the dispatcher drops the
    /// future at its next await point once the token fires either way.
    async fn run(
        &self,
        args: &str,
        sink: ChunkSink,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Streams non-terminal output for one command.
#[derive(Debug, Clone)]
pub struct ChunkSink {
    id: CorrelationId,
    writer: PipeWriter,
}

impl ChunkSink {
    pub fn new(id: CorrelationId, writer: PipeWriter) -> Self {
        Self { id, writer }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Send a batch of lines. Empty batches are skipped.
    pub async fn send(&self, chunks: Vec<String>) -> Result<(), HandlerError> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.writer
            .send(Message::CommandResponse {
                id: self.id,
                chunks,
                status: ResponseStatus::Streaming,
            })
            .await
            .map_err(|_| HandlerError::OutputClosed)
    }

    pub async fn line(&self, line: impl Into<String>) -> Result<(), HandlerError> {
        self.send(vec![line.into()]).await
    }
}

// ── HandlerRegistry ──────────────────────────────────────────────

/// Maps command words to handlers. Lookup is case-insensitive.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handler`, replacing any handler with the same name.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) -> &mut Self {
        let key = handler.name().to_ascii_lowercase();
        if self.handlers.insert(key, handler).is_some() {
            debug!("handler replaced");
        }
        self
    }

    pub fn with(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    /// Split `command_line` into its handler and argument string.
    pub fn resolve(&self, command_line: &str) -> Result<(Arc<dyn CommandHandler>, String), String> {
        let trimmed = command_line.trim();
        let (word, args) = match trimmed.split_once(char::is_whitespace) {
            Some((word, args)) => (word, args.trim()),
            None => (trimmed, ""),
        };
        if word.is_empty() {
            return Err("empty command line".to_string());
        }
        self.handlers
            .get(&word.to_ascii_lowercase())
            .map(|h| (Arc::clone(h), args.to_string()))
            .ok_or_else(|| format!("unknown command '{word}'"))
    }

    /// `(name, summary)` for every handler, sorted by name.
    pub fn summaries(&self) -> Vec<(String, String)> {
        let mut list: Vec<_> = self
            .handlers
            .values()
            .map(|h| (h.name().to_string(), h.summary().to_string()))
            .collect();
        list.sort();
        list
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

// ── Dispatcher ───────────────────────────────────────────────────

/// Tracks the commands running on one server session.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    active: Arc<Mutex<HashMap<CorrelationId, CancellationToken>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `command_line` under `id`.
    ///
    /// Fails with `DuplicateRequest` if `id` is already running; nothing is
    /// spawned in that case.
    pub fn dispatch(
        &self,
        id: CorrelationId,
        command_line: String,
        writer: PipeWriter,
        connection: &CancellationToken,
    ) -> Result<(), PmxError> {
        let token = connection.child_token();
        {
            let mut active = self.lock();
            if active.contains_key(&id) {
                return Err(PmxError::DuplicateRequest(id));
            }
            active.insert(id, token.clone());
        }

        let this = self.clone();
        tokio::spawn(async move {
            let status = this.run(id, &command_line, writer.clone(), token).await;
            this.lock().remove(&id);

            match &status {
                ResponseStatus::Faulted(msg) => warn!(%id, command = %command_line, "command faulted: {msg}"),
                status => debug!(%id, ?status, "command finished"),
            }
            let terminal = Message::CommandResponse {
                id,
                chunks: Vec::new(),
                status,
            };
            if let Err(e) = writer.send(terminal).await {
                debug!(%id, "terminal response not delivered: {e}");
            }
        });
        Ok(())
    }

    async fn run(
        &self,
        id: CorrelationId,
        command_line: &str,
        writer: PipeWriter,
        token: CancellationToken,
    ) -> ResponseStatus {
        let (handler, args) = match self.registry.resolve(command_line) {
            Ok(found) => found,
            Err(msg) => return ResponseStatus::Faulted(msg),
        };
        info!(%id, command = handler.name(), "running command");

        let sink = ChunkSink::new(id, writer);
        tokio::select! {
            biased;
            _ = token.cancelled() => ResponseStatus::Cancelled,
            result = handler.run(&args, sink, token.clone()) => match result {
                Ok(()) => ResponseStatus::Completed,
                Err(_) if token.is_cancelled() => ResponseStatus::Cancelled,
                Err(e) => ResponseStatus::Faulted(e.to_string()),
            },
        }
    }

    /// Fire the cancellation token of `target`.
    ///
    /// Returns `false` for unknown or already finished commands.
    pub fn cancel(&self, target: CorrelationId) -> bool {
        match self.lock().get(&target) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_active(&self, id: CorrelationId) -> bool {
        self.lock().contains_key(&id)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PipeReader, split_pipe};
    use std::time::Duration;

    struct List;

    #[async_trait]
    impl CommandHandler for List {
        fn name(&self) -> &str {
            "list"
        }

        async fn run(&self, _: &str, sink: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
            sink.send(vec!["a".into(), "b".into()]).await
        }
    }

    struct Slow;

    #[async_trait]
    impl CommandHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn run(&self, _: &str, _: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct Boom;

    #[async_trait]
    impl CommandHandler for Boom {
        fn name(&self) -> &str {
            "boom"
        }

        async fn run(&self, args: &str, _: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
            Err(HandlerError::Failed(format!("exploded: {args}")))
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        writer: PipeWriter,
        reader: PipeReader,
        // Unused halves stay alive so the duplex does not report EOF.
        _server_reader: PipeReader,
        _client_writer: PipeWriter,
    }

    fn setup() -> Harness {
        let registry = HandlerRegistry::new().with(List).with(Slow).with(Boom);
        let (server, client) = tokio::io::duplex(4096);
        let (_server_reader, writer) = split_pipe(server);
        let (reader, _client_writer) = split_pipe(client);
        Harness {
            dispatcher: Dispatcher::new(Arc::new(registry)),
            writer,
            reader,
            _server_reader,
            _client_writer,
        }
    }

    async fn next_response(reader: &mut PipeReader) -> (CorrelationId, Vec<String>, ResponseStatus) {
        let msg = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .expect("response in time")
            .expect("stream open")
            .expect("valid frame");
        match msg {
            Message::CommandResponse { id, chunks, status } => (id, chunks, status),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn streams_then_completes_with_empty_terminal() {
        let Harness { dispatcher, writer, mut reader, .. } = setup();
        let conn = CancellationToken::new();
        let id = CorrelationId::new();
        dispatcher.dispatch(id, "LIST".into(), writer, &conn).unwrap();

        assert_eq!(
            next_response(&mut reader).await,
            (id, vec!["a".to_string(), "b".to_string()], ResponseStatus::Streaming)
        );
        assert_eq!(next_response(&mut reader).await, (id, vec![], ResponseStatus::Completed));
        assert!(!dispatcher.is_active(id));
        assert!(!dispatcher.cancel(id));
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_while_running() {
        let Harness { dispatcher, writer, .. } = setup();
        let conn = CancellationToken::new();
        let id = CorrelationId::new();
        dispatcher.dispatch(id, "slow".into(), writer.clone(), &conn).unwrap();
        assert!(matches!(
            dispatcher.dispatch(id, "slow".into(), writer, &conn),
            Err(PmxError::DuplicateRequest(dup)) if dup == id
        ));
        assert_eq!(dispatcher.active_count(), 1);
        conn.cancel();
    }

    #[tokio::test]
    async fn cancel_ends_with_cancelled_not_faulted() {
        let Harness { dispatcher, writer, mut reader, .. } = setup();
        let conn = CancellationToken::new();
        let id = CorrelationId::new();
        dispatcher.dispatch(id, "slow".into(), writer, &conn).unwrap();

        assert!(dispatcher.cancel(id));
        assert_eq!(next_response(&mut reader).await, (id, vec![], ResponseStatus::Cancelled));
        assert_eq!(dispatcher.active_count(), 0);
    }

    #[tokio::test]
    async fn handler_errors_and_unknown_commands_fault() {
        let Harness { dispatcher, writer, mut reader, .. } = setup();
        let conn = CancellationToken::new();

        let id = CorrelationId::new();
        dispatcher.dispatch(id, "boom now".into(), writer.clone(), &conn).unwrap();
        assert_eq!(
            next_response(&mut reader).await.2,
            ResponseStatus::Faulted("exploded: now".into())
        );

        let id = CorrelationId::new();
        dispatcher.dispatch(id, "frobnicate".into(), writer, &conn).unwrap();
        assert_eq!(
            next_response(&mut reader).await.2,
            ResponseStatus::Faulted("unknown command 'frobnicate'".into())
        );
    }

    #[tokio::test]
    async fn connection_token_cancels_children() {
        let Harness { dispatcher, writer, mut reader, .. } = setup();
        let conn = CancellationToken::new();
        let id = CorrelationId::new();
        dispatcher.dispatch(id, "slow".into(), writer, &conn).unwrap();

        conn.cancel();
        assert_eq!(next_response(&mut reader).await.2, ResponseStatus::Cancelled);
    }

    #[test]
    fn resolve_splits_word_and_args() {
        let registry = HandlerRegistry::new().with(Boom);
        let (handler, args) = registry.resolve("  Boom   a b  ").unwrap();
        assert_eq!(handler.name(), "boom");
        assert_eq!(args, "a b");
        assert_eq!(registry.resolve("   ").err().as_deref(), Some("empty command line"));
        assert_eq!(registry.summaries().len(), 1);
    }
}
