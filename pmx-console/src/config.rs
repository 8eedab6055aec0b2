//! Configuration for the PMX console.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pmx_core::client::ConnectOptions;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Pipe to attach to at startup: a service name, a full pipe name or a
    /// path. Empty picks the first pipe that answers.
    pub pipe: String,
    /// Where hosts create their pipes (Unix only). Empty means the
    /// platform default.
    pub directory: String,
    /// Sent to the host in the handshake.
    pub description: String,
    /// Bound on opening the pipe plus the handshake.
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the console's own diagnostics on stderr.
    pub level: String,
    /// Print log records pushed by the host.
    pub show_pushed_logs: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pipe: String::new(),
            directory: String::new(),
            description: "pmx-console".into(),
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            show_pushed_logs: true,
        }
    }
}

impl ConsoleConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::debug!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Options for connecting to `pipe`, or to the configured pipe when
    /// `None`.
    pub fn connect_options(&self, pipe: Option<&str>) -> ConnectOptions {
        let wanted = pipe.unwrap_or(&self.connection.pipe).trim();
        let dir = self.connection.directory.trim();
        ConnectOptions {
            description: self.connection.description.clone(),
            endpoint: (!wanted.is_empty()).then(|| wanted.to_string()),
            timeout: Duration::from_millis(self.connection.connect_timeout_ms.max(1)),
            pipe_dir: (!dir.is_empty()).then(|| PathBuf::from(dir)),
        }
    }
}
