//! Platform pipe plumbing: opening a client end and accepting server ends.
//!
//! Unix hosts listen on a domain socket; Windows hosts on a named pipe.
//! Both are exposed as a boxed [`PipeStream`] so the rest of the crate
//! never sees the platform type.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::error::PmxError;
use crate::network::endpoint::Endpoint;

/// Any duplex byte stream a PMX connection can run over.
pub trait PipeStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PipeStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedPipe = Box<dyn PipeStream>;

/// Open the client end of `endpoint`.
///
/// Fails with `ConnectTimeout` once `timeout` elapses and with
/// `PipeUnavailable` when the pipe is missing or refuses the connection.
pub async fn open(endpoint: &Endpoint, timeout: Duration) -> Result<BoxedPipe, PmxError> {
    debug!(pipe = %endpoint.pipe_name(), "opening pipe");
    match tokio::time::timeout(timeout, open_platform(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(PmxError::ConnectTimeout(timeout)),
    }
}

fn unavailable(endpoint: &Endpoint, e: std::io::Error) -> PmxError {
    PmxError::PipeUnavailable(format!("{}: {e}", endpoint.path.display()))
}

#[cfg(unix)]
async fn open_platform(endpoint: &Endpoint) -> Result<BoxedPipe, PmxError> {
    let stream = tokio::net::UnixStream::connect(&endpoint.path)
        .await
        .map_err(|e| unavailable(endpoint, e))?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
async fn open_platform(endpoint: &Endpoint) -> Result<BoxedPipe, PmxError> {
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;

    loop {
        match ClientOptions::new().open(&endpoint.path) {
            Ok(client) => return Ok(Box::new(client)),
            // Every instance is taken; the server re-arms one per accept.
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(unavailable(endpoint, e)),
        }
    }
}

// ── PipeListener ─────────────────────────────────────────────────

/// Server end: accepts one [`BoxedPipe`] per client.
pub struct PipeListener {
    endpoint: Endpoint,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(windows)]
    next: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

impl PipeListener {
    /// Start listening on `endpoint`.
    #[cfg(unix)]
    pub fn bind(endpoint: Endpoint) -> Result<Self, PmxError> {
        if let Some(dir) = endpoint.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if endpoint.path.exists() {
            // A live host answers; a stale socket file from a crash does not.
            if std::os::unix::net::UnixStream::connect(&endpoint.path).is_ok() {
                return Err(PmxError::PipeUnavailable(format!(
                    "{} is already served by another host",
                    endpoint.path.display()
                )));
            }
            debug!(path = %endpoint.path.display(), "removing stale socket");
            std::fs::remove_file(&endpoint.path)?;
        }
        let listener = tokio::net::UnixListener::bind(&endpoint.path)?;
        info!(pipe = %endpoint.pipe_name(), path = %endpoint.path.display(), "listening");
        Ok(Self { endpoint, listener })
    }

    #[cfg(windows)]
    pub fn bind(endpoint: Endpoint) -> Result<Self, PmxError> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&endpoint.path)
            .map_err(|e| unavailable(&endpoint, e))?;
        info!(pipe = %endpoint.pipe_name(), "listening");
        Ok(Self {
            endpoint,
            next: Some(first),
        })
    }

    /// Wait for the next client.
    #[cfg(unix)]
    pub async fn accept(&mut self) -> Result<BoxedPipe, PmxError> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Box::new(stream))
    }

    #[cfg(windows)]
    pub async fn accept(&mut self) -> Result<BoxedPipe, PmxError> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let server = match self.next.take() {
            Some(server) => server,
            None => ServerOptions::new().create(&self.endpoint.path)?,
        };
        server.connect().await?;
        // Arm the next instance before handing this one out so clients
        // never see the pipe missing.
        self.next = Some(ServerOptions::new().create(&self.endpoint.path)?);
        Ok(Box::new(server))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(unix)]
impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.endpoint.path);
    }
}
