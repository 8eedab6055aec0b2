//! Framed halves of a pipe.
//!
//! The writer is shared by every caller on a connection; a single async
//! mutex around the sink keeps frames from interleaving, and `send` only
//! returns once the frame has been flushed to the pipe. The reader is owned
//! by exactly one loop and yields one whole message per `next()`.
//!
//! An I/O error on any write latches the writer as failed. Whoever owns the
//! connection watches [`PipeWriter::failed`] and tears it down, so a write
//! error from a background task still closes the whole connection.

use std::sync::{Arc, OnceLock};

use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::codec::PmxCodec;
use crate::error::PmxError;
use crate::message::Message;
use crate::network::pipe::{BoxedPipe, PipeStream};

/// Split `stream` into its framed reader and shared writer.
pub fn split_pipe<S: PipeStream>(stream: S) -> (PipeReader, PipeWriter) {
    let boxed: BoxedPipe = Box::new(stream);
    let (read_half, write_half) = tokio::io::split(boxed);
    (
        PipeReader {
            frames: FramedRead::new(read_half, PmxCodec),
        },
        PipeWriter {
            sink: Arc::new(Mutex::new(FramedWrite::new(write_half, PmxCodec))),
            failure: Arc::new(WriteFailure::default()),
        },
    )
}

// ── PipeWriter ───────────────────────────────────────────────────

/// Clonable, serialised write side of a connection.
#[derive(Clone)]
pub struct PipeWriter {
    sink: Arc<Mutex<FramedWrite<WriteHalf<BoxedPipe>, PmxCodec>>>,
    failure: Arc<WriteFailure>,
}

#[derive(Debug, Default)]
struct WriteFailure {
    latched: CancellationToken,
    reason: OnceLock<String>,
}

impl PipeWriter {
    /// Write one message and flush it.
    ///
    /// Encoding errors only fail this call. An I/O error also marks the
    /// writer as failed, and every later send fails at once.
    pub async fn send(&self, message: Message) -> Result<(), PmxError> {
        let kind = message.kind();
        let mut sink = self.sink.lock().await;
        if let Some(reason) = self.failure.reason.get() {
            return Err(PmxError::ConnectionLost(reason.clone()));
        }
        match sink.send(message).await {
            Ok(()) => {
                trace!(%kind, "frame flushed");
                Ok(())
            }
            Err(PmxError::Io(e)) => {
                let reason = format!("pipe write failed: {e}");
                debug!(%kind, "{reason}");
                let _ = self.failure.reason.set(reason);
                self.failure.latched.cancel();
                Err(PmxError::Io(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves with the failure reason once a write has hit an I/O error.
    pub async fn failed(&self) -> String {
        self.failure.latched.cancelled().await;
        self.failure_reason()
            .unwrap_or_else(|| "pipe write failed".to_string())
    }

    /// Why the writer failed, if it has.
    pub fn failure_reason(&self) -> Option<String> {
        self.failure.reason.get().cloned()
    }

    /// Flush and shut down the write half. Errors are ignored: the peer
    /// may already be gone.
    pub async fn shutdown(&self) {
        let mut sink = self.sink.lock().await;
        // A failed sink still holds the frame it could not write.
        if self.failure.reason.get().is_none() {
            let _ = sink.close().await;
        }
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}

// ── PipeReader ───────────────────────────────────────────────────

/// Read side of a connection.
pub struct PipeReader {
    frames: FramedRead<ReadHalf<BoxedPipe>, PmxCodec>,
}

impl PipeReader {
    /// Next whole message; `None` at end of stream.
    pub async fn next(&mut self) -> Option<Result<Message, PmxError>> {
        self.frames.next().await
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader").finish_non_exhaustive()
    }
}
