//! PMX console: attach to a host over a named pipe and run commands.
//!
//! ```text
//! pmx-console                       Connect to the first pipe that answers
//! pmx-console --pipe <name>         Connect to a service, pipe name or path
//! pmx-console --pipe-dir <dir>      Look for pipes in <dir> (Unix)
//! pmx-console --timeout-ms <n>      Connect/handshake timeout
//! pmx-console --offline             Start at the prompt without connecting
//! pmx-console --config <path>       Load a custom config TOML
//! pmx-console --gen-config          Write default config to stdout
//! ```

mod config;
mod console;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::ConsoleConfig;
use crate::console::{Console, spawn_input};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pmx-console", about = "PMX operator console")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "pmx-console.toml")]
    config: PathBuf,

    /// Pipe to attach to: service name, pipe name or path.
    #[arg(short, long)]
    pipe: Option<String>,

    /// Directory holding the pipes.
    #[arg(long)]
    pipe_dir: Option<PathBuf>,

    /// Connect and handshake timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Start without connecting.
    #[arg(long)]
    offline: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ConsoleConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ConsoleConfig::load(&cli.config);
    if let Some(pipe) = cli.pipe {
        config.connection.pipe = pipe;
    }
    if let Some(dir) = cli.pipe_dir {
        config.connection.directory = dir.display().to_string();
    }
    if let Some(timeout) = cli.timeout_ms {
        config.connection.connect_timeout_ms = timeout;
    }

    // Diagnostics go to stderr so they never mix with command output.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut console = Console::new(config);
    console.run(spawn_input(), !cli.offline).await;

    Ok(())
}
