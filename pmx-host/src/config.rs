//! Configuration for the PMX host service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pmx_core::network::{Endpoint, default_pipe_dir, local_host_name};
use pmx_core::server::ServerOptions;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Pipe naming.
    pub pipe: PipeConfig,
    /// Log pushes to connected consoles.
    pub push: PushConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Pipe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Service name; the pipe is `pmx.<service>.<host>`.
    pub service: String,
    /// Directory holding the pipe (Unix only). Empty means the platform
    /// default.
    pub directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Push host log records to consoles at all.
    pub enabled: bool,
    /// Seconds of history replayed to a console right after it connects.
    pub log_backlog_secs: u64,
    /// Records kept in memory for replay and `logs`.
    pub log_capacity: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Lowest level copied into the in-memory store pushed to consoles.
    pub capture_level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            service: "host".into(),
            directory: String::new(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_backlog_secs: 300,
            log_capacity: 4096,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            capture_level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn pipe_dir(&self) -> PathBuf {
        if self.pipe.directory.trim().is_empty() {
            default_pipe_dir()
        } else {
            PathBuf::from(self.pipe.directory.trim())
        }
    }

    /// The endpoint this host listens on.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.pipe.service, &local_host_name(), &self.pipe_dir())
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            log_backlog: Duration::from_secs(self.push.log_backlog_secs),
            push_logs: self.push.enabled,
        }
    }

    /// The configured capture level; unparsable values mean `info`.
    pub fn capture_level(&self) -> tracing::Level {
        self.logging
            .capture_level
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&HostConfig::default()).unwrap();
        assert!(text.contains("service"));
        assert!(text.contains("log_backlog_secs"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let parsed: HostConfig = toml::from_str("[pipe]\nservice = \"billing\"\n").unwrap();
        assert_eq!(parsed.pipe.service, "billing");
        assert_eq!(parsed.push.log_backlog_secs, 300);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn endpoint_uses_configured_directory() {
        let mut cfg = HostConfig::default();
        cfg.pipe.service = "jobs".into();
        cfg.pipe.directory = "/run/pmx-test".into();
        let ep = cfg.endpoint();
        assert_eq!(ep.name, "jobs");
        assert!(ep.path.starts_with("/run/pmx-test"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = HostConfig::load(Path::new("/definitely/not/here.toml"));
        assert_eq!(cfg.pipe.service, "host");
        assert_eq!(cfg.server_options().log_backlog, Duration::from_secs(300));
    }

    #[test]
    fn capture_level_parses() {
        let mut cfg = HostConfig::default();
        cfg.logging.capture_level = "warn".into();
        assert_eq!(cfg.capture_level(), tracing::Level::WARN);
        cfg.logging.capture_level = "loud".into();
        assert_eq!(cfg.capture_level(), tracing::Level::INFO);
    }
}
