//! PMX host entry point.
//!
//! ```text
//! pmx-host                   Serve in the foreground
//! pmx-host --config <path>   Load a custom config TOML
//! pmx-host --service <name>  Override the service name
//! pmx-host --gen-config      Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use pmx_core::log::MemoryLogStore;
use pmx_host::config::HostConfig;
use pmx_host::logging;
use pmx_host::service::HostService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pmx-host", about = "PMX host: answers console commands over a named pipe")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "pmx-host.toml")]
    config: PathBuf,

    /// Service name (overrides the config file).
    #[arg(short, long)]
    service: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    if let Some(service) = cli.service {
        config.pipe.service = service;
    }

    let logs = Arc::new(MemoryLogStore::new(config.push.log_capacity));
    logging::init(&config, Arc::clone(&logs));

    info!("pmx-host v{}", env!("CARGO_PKG_VERSION"));
    info!("pipe: {}", config.endpoint());
    info!("log backlog: {}s", config.push.log_backlog_secs);

    let service = HostService::new(&config, logs);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    Ok(())
}
