//! Host service core logic.
//!
//! Owns the pipe server, the built-in command registry and the log store
//! shared with the tracing capture layer.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;

use pmx_core::log::MemoryLogStore;
use pmx_core::server::PipeServer;

use crate::config::HostConfig;
use crate::handlers::{HostInfo, builtin_registry};

// ── HostService ──────────────────────────────────────────────────

/// The top-level host service.
pub struct HostService {
    server: PipeServer,
    stop: CancellationToken,
}

impl HostService {
    /// Build the service. `logs` should be the store the capture layer
    /// writes to so consoles see host logs.
    pub fn new(config: &HostConfig, logs: Arc<MemoryLogStore>) -> Self {
        let endpoint = config.endpoint();
        let info = Arc::new(HostInfo {
            endpoint: endpoint.clone(),
            pipe_dir: config.pipe_dir(),
            started: Instant::now(),
            logs: Arc::clone(&logs),
        });
        let server = PipeServer::new(
            endpoint,
            builtin_registry(info),
            logs,
            config.server_options(),
        );
        Self {
            server,
            stop: CancellationToken::new(),
        }
    }

    /// Token that stops the service when cancelled (Ctrl-C handler).
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Serve consoles until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!(pipe = %self.server.endpoint().pipe_name(), "host service starting");
        self.server.serve(self.stop.clone()).await?;
        info!("host service stopped");
        Ok(())
    }
}
