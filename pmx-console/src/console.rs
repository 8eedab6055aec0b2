//! Interactive line console.
//!
//! Reads lines from a dedicated input thread, interprets a handful of
//! local commands and forwards everything else to the attached host.
//! Ctrl-C cancels the running command; at the prompt it exits.

use std::io::{BufRead, BufReader, Read, Write};

use crossterm::style::Stylize;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use pmx_core::client::{PipeClient, PushEvent};
use pmx_core::command::{CommandEvent, CommandOutcome};
use pmx_core::log::{LogLevel, LogRecord};
use pmx_core::network::{default_pipe_dir, discover};

use crate::config::ConsoleConfig;

// ── Input ────────────────────────────────────────────────────────

/// One interpreted input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Connect(Option<String>),
    Disconnect,
    Pipes,
    State,
    Exit,
    Empty,
    /// Anything else goes to the host verbatim.
    Command(String),
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let (word, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (trimmed, ""),
        };
        match word.to_ascii_lowercase().as_str() {
            "" => Input::Empty,
            "connect" => Input::Connect((!rest.is_empty()).then(|| rest.to_string())),
            "disconnect" if rest.is_empty() => Input::Disconnect,
            "pipes" if rest.is_empty() => Input::Pipes,
            "state" if rest.is_empty() => Input::State,
            "exit" | "quit" if rest.is_empty() => Input::Exit,
            _ => Input::Command(trimmed.to_string()),
        }
    }
}

/// Spawn the stdin reader. The channel closes at end of input.
pub fn spawn_input() -> mpsc::UnboundedReceiver<String> {
    spawn_reader(std::io::stdin())
}

/// Runs on a detached OS thread: runtime shutdown must not wait for a
/// `read` that only returns on the next line.
fn spawn_reader<R: Read + Send + 'static>(input: R) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in BufReader::new(input).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

// ── Rendering ────────────────────────────────────────────────────

pub fn render_log(record: &LogRecord) -> String {
    let line = record.to_string();
    match record.level {
        LogLevel::Error => line.red().to_string(),
        LogLevel::Warn => line.yellow().to_string(),
        LogLevel::Info => line.dark_grey().to_string(),
        LogLevel::Debug | LogLevel::Trace => line.dark_grey().dim().to_string(),
    }
}

pub fn render_outcome(outcome: &CommandOutcome) -> String {
    let text = format!("[{outcome}]");
    match outcome {
        CommandOutcome::Completed => text.green().to_string(),
        CommandOutcome::Faulted(_) => text.red().to_string(),
        CommandOutcome::Cancelled(_) => text.yellow().to_string(),
    }
}

fn notice(message: impl std::fmt::Display) {
    println!("{}", format!("-- {message}").cyan());
}

fn failure(message: impl std::fmt::Display) {
    println!("{}", format!("!! {message}").red());
}

fn prompt() {
    print!("{} ", "pmx>".bold());
    let _ = std::io::stdout().flush();
}

// ── Console ──────────────────────────────────────────────────────

pub struct Console {
    config: ConsoleConfig,
    client: Option<PipeClient>,
    /// Stops the push printer of the current connection.
    printer: Option<CancellationToken>,
}

impl Console {
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            config,
            client: None,
            printer: None,
        }
    }

    /// Run until `exit`, end of input or Ctrl-C at the prompt.
    pub async fn run(&mut self, mut lines: mpsc::UnboundedReceiver<String>, autoconnect: bool) {
        if autoconnect {
            self.connect(None).await;
        }

        loop {
            prompt();
            let line = tokio::select! {
                line = lines.recv() => line,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                println!();
                break;
            };
            match Input::parse(&line) {
                Input::Empty => {}
                Input::Exit => break,
                Input::Connect(pipe) => self.connect(pipe).await,
                Input::Disconnect => self.disconnect().await,
                Input::Pipes => self.list_pipes(),
                Input::State => self.show_state(),
                Input::Command(command) => self.execute(command).await,
            }
        }

        self.disconnect().await;
    }

    async fn connect(&mut self, pipe: Option<String>) {
        self.disconnect().await;

        let options = self.config.connect_options(pipe.as_deref());
        let token = CancellationToken::new();
        let connecting = PipeClient::connect(options, token.clone());
        let result = tokio::select! {
            result = connecting => result,
            _ = tokio::signal::ctrl_c() => {
                token.cancel();
                Err(pmx_core::PmxError::Cancelled)
            }
        };

        match result {
            Ok(client) => {
                match client.endpoint() {
                    Some(endpoint) => notice(format!("connected to {}", endpoint.pipe_name())),
                    None => notice("connected"),
                }
                self.printer = Some(self.spawn_printer(&client));
                self.client = Some(client);
            }
            Err(e) => failure(format!("connect failed: {e}")),
        }
    }

    /// Print host pushes in the background for as long as the connection
    /// lives.
    fn spawn_printer(&self, client: &PipeClient) -> CancellationToken {
        let stop = CancellationToken::new();
        let show_logs = self.config.logging.show_pushed_logs;
        let mut events = BroadcastStream::new(client.events());
        tokio::spawn({
            let stop = stop.clone();
            async move {
                loop {
                    let event = tokio::select! {
                        _ = stop.cancelled() => break,
                        event = events.next() => event,
                    };
                    match event {
                        None => break,
                        Some(Ok(PushEvent::Log(record))) => {
                            if show_logs {
                                println!("{}", render_log(&record));
                            }
                        }
                        Some(Ok(PushEvent::Disconnected(reason))) => {
                            notice(format!("disconnected: {reason}"));
                            break;
                        }
                        Some(Err(e)) => tracing::debug!("push events lagged: {e}"),
                    }
                }
            }
        });
        stop
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            if !client.state().is_closed() {
                if let Err(e) = client.disconnect().await {
                    failure(format!("disconnect failed: {e}"));
                }
            }
        }
        if let Some(printer) = self.printer.take() {
            printer.cancel();
        }
    }

    fn list_pipes(&self) {
        let options = self.config.connect_options(None);
        let dir = options.pipe_dir.unwrap_or_else(default_pipe_dir);
        let found = discover(&dir);
        if found.is_empty() {
            notice(format!("no pipes in {}", dir.display()));
            return;
        }
        let current = self.client.as_ref().and_then(PipeClient::endpoint);
        for endpoint in found {
            let marker = if Some(&endpoint) == current { "*" } else { " " };
            println!("{marker} {:<32} {}", endpoint.pipe_name(), endpoint.path.display());
        }
    }

    fn show_state(&self) {
        match &self.client {
            None => notice("not connected"),
            Some(client) => {
                let pipe = client
                    .endpoint()
                    .map(|e| e.pipe_name())
                    .unwrap_or_else(|| "?".into());
                notice(format!(
                    "{pipe}: {} ({} pending)",
                    client.state(),
                    client.pending_count()
                ));
            }
        }
    }

    /// Run one host command in the foreground, streaming its output.
    async fn execute(&mut self, command: String) {
        let Some(client) = self.client.as_ref() else {
            failure("not connected; use 'connect [pipe]'");
            return;
        };

        let token = CancellationToken::new();
        let (id, mut stream) = match client.execute(command.clone(), token.clone()).await {
            Ok(started) => started,
            Err(e) => {
                failure(e);
                return;
            }
        };
        tracing::debug!(%id, %command, "command started");

        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = tokio::signal::ctrl_c(), if !token.is_cancelled() => {
                    token.cancel();
                    continue;
                }
            };
            match event {
                Some(CommandEvent::Chunk(line)) => println!("{line}"),
                Some(CommandEvent::Finished(outcome)) => {
                    if let CommandOutcome::Cancelled(pmx_core::CancelReason::ConnectionLost(_)) =
                        &outcome
                    {
                        failure(format!("'{command}' ({id}) was in flight"));
                    }
                    println!("{}", render_outcome(&outcome));
                }
                None => break,
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
