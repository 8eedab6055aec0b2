//! Built-in host commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use pmx_core::dispatch::{ChunkSink, CommandHandler, HandlerRegistry};
use pmx_core::error::HandlerError;
use pmx_core::log::{LogSource, MemoryLogStore};
use pmx_core::network::{Endpoint, discover};

/// Lines per `CommandResponse` for commands producing bulk output.
const BATCH: usize = 100;

/// Facts about the running host shared by the built-ins.
pub struct HostInfo {
    pub endpoint: Endpoint,
    pub pipe_dir: PathBuf,
    pub started: Instant,
    pub logs: Arc<MemoryLogStore>,
}

/// Registry with every built-in command, `help` included.
pub fn builtin_registry(info: Arc<HostInfo>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new()
        .with(Ping)
        .with(Echo)
        .with(List {
            info: Arc::clone(&info),
        })
        .with(Logs {
            info: Arc::clone(&info),
        })
        .with(Sleep)
        .with(Count)
        .with(Fail);
    let commands = registry.len() + 2;
    registry = registry.with(Status { info, commands });
    let mut topics = registry.summaries();
    topics.push(("help".into(), Help::SUMMARY.into()));
    topics.sort();
    registry.with(Help { topics })
}

fn parse_number<T: std::str::FromStr>(args: &str, what: &str) -> Result<T, HandlerError> {
    args.split_whitespace()
        .next()
        .ok_or_else(|| HandlerError::InvalidArguments(format!("expected {what}")))?
        .parse()
        .map_err(|_| HandlerError::InvalidArguments(format!("'{args}' is not a valid {what}")))
}

async fn send_batched(sink: &ChunkSink, lines: Vec<String>) -> Result<(), HandlerError> {
    let mut lines = lines.into_iter().peekable();
    while lines.peek().is_some() {
        sink.send(lines.by_ref().take(BATCH).collect()).await?;
    }
    Ok(())
}

// ── Simple commands ──────────────────────────────────────────────

struct Help {
    topics: Vec<(String, String)>,
}

impl Help {
    const SUMMARY: &'static str = "list available commands";
}

#[async_trait]
impl CommandHandler for Help {
    fn name(&self) -> &str {
        "help"
    }

    fn summary(&self) -> &str {
        Self::SUMMARY
    }

    async fn run(&self, _: &str, sink: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
        let width = self.topics.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        let lines = self
            .topics
            .iter()
            .map(|(name, summary)| format!("{name:<width$}  {summary}"))
            .collect();
        sink.send(lines).await
    }
}

struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    fn summary(&self) -> &str {
        "reply with pong"
    }

    async fn run(&self, _: &str, sink: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
        sink.line("pong").await
    }
}

struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn summary(&self) -> &str {
        "echo <text>: repeat the text back"
    }

    async fn run(&self, args: &str, sink: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
        sink.line(args).await
    }
}

struct Fail;

#[async_trait]
impl CommandHandler for Fail {
    fn name(&self) -> &str {
        "fail"
    }

    fn summary(&self) -> &str {
        "fail <message>: always fails"
    }

    async fn run(&self, args: &str, _: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
        let message = if args.is_empty() { "failed on request" } else { args };
        Err(HandlerError::Failed(message.to_string()))
    }
}

// ── Host inspection ──────────────────────────────────────────────

/// PMX pipes visible in the host's pipe directory.
struct List {
    info: Arc<HostInfo>,
}

#[async_trait]
impl CommandHandler for List {
    fn name(&self) -> &str {
        "list"
    }

    fn summary(&self) -> &str {
        "list PMX pipes on this machine"
    }

    async fn run(&self, _: &str, sink: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
        let lines = discover(&self.info.pipe_dir)
            .into_iter()
            .map(|ep| {
                let marker = if ep == self.info.endpoint { " (this host)" } else { "" };
                format!("{}{marker}", ep.pipe_name())
            })
            .collect();
        send_batched(&sink, lines).await
    }
}

struct Logs {
    info: Arc<HostInfo>,
}

#[async_trait]
impl CommandHandler for Logs {
    fn name(&self) -> &str {
        "logs"
    }

    fn summary(&self) -> &str {
        "logs [seconds]: recent host log records (default 60)"
    }

    async fn run(&self, args: &str, sink: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
        let seconds: u64 = if args.is_empty() {
            60
        } else {
            parse_number(args, "number of seconds")?
        };
        let seconds = i64::try_from(seconds).map_err(|_| {
            HandlerError::InvalidArguments(format!("{seconds} seconds is out of range"))
        })?;
        // A window past the representable range covers everything retained.
        let since = TimeDelta::try_seconds(seconds)
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let lines = self
            .info
            .logs
            .query(since)
            .iter()
            .map(ToString::to_string)
            .collect();
        send_batched(&sink, lines).await
    }
}

#[derive(Serialize)]
struct StatusReport<'a> {
    service: &'a str,
    host: &'a str,
    pipe: String,
    version: &'static str,
    uptime_secs: u64,
    log_records: usize,
    commands: usize,
}

struct Status {
    info: Arc<HostInfo>,
    commands: usize,
}

#[async_trait]
impl CommandHandler for Status {
    fn name(&self) -> &str {
        "status"
    }

    fn summary(&self) -> &str {
        "host status as JSON"
    }

    async fn run(&self, _: &str, sink: ChunkSink, _: CancellationToken) -> Result<(), HandlerError> {
        let report = StatusReport {
            service: &self.info.endpoint.name,
            host: &self.info.endpoint.host,
            pipe: self.info.endpoint.pipe_name(),
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.info.started.elapsed().as_secs(),
            log_records: self.info.logs.len(),
            commands: self.commands,
        };
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        sink.send(json.lines().map(str::to_string).collect()).await
    }
}

// ── Long-running commands ────────────────────────────────────────

struct Sleep;

#[async_trait]
impl CommandHandler for Sleep {
    fn name(&self) -> &str {
        "sleep"
    }

    fn summary(&self) -> &str {
        "sleep <seconds>: report once per second (cancellable)"
    }

    async fn run(&self, args: &str, sink: ChunkSink, cancel: CancellationToken) -> Result<(), HandlerError> {
        let seconds: u64 = parse_number(args, "number of seconds")?;
        for elapsed in 1..=seconds {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            sink.line(format!("slept {elapsed}/{seconds}s")).await?;
        }
        Ok(())
    }
}

struct Count;

#[async_trait]
impl CommandHandler for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn summary(&self) -> &str {
        "count <n>: stream the numbers 1 to n"
    }

    async fn run(&self, args: &str, sink: ChunkSink, cancel: CancellationToken) -> Result<(), HandlerError> {
        let n: u64 = parse_number(args, "count")?;
        let mut next = 1;
        while next <= n && !cancel.is_cancelled() {
            let end = n.min(next + BATCH as u64 - 1);
            sink.send((next..=end).map(|i| i.to_string()).collect()).await?;
            next = end + 1;
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pmx_core::dispatch::Dispatcher;
    use pmx_core::log::{LogLevel, LogRecord};
    use pmx_core::message::{CorrelationId, Message, ResponseStatus};
    use pmx_core::network::split_pipe;

    fn info() -> Arc<HostInfo> {
        let dir = std::env::temp_dir().join("pmx-handlers-none");
        Arc::new(HostInfo {
            endpoint: Endpoint::new("jobs", "box", &dir),
            pipe_dir: dir,
            started: Instant::now(),
            logs: Arc::new(MemoryLogStore::new(64)),
        })
    }

    /// Run `line` to completion and collect every chunk plus the terminal
    /// status.
    async fn run(info: Arc<HostInfo>, line: &str, cancel_after: Option<Duration>) -> (Vec<String>, ResponseStatus) {
        let dispatcher = Dispatcher::new(Arc::new(builtin_registry(info)));
        let (server, client) = tokio::io::duplex(64 * 1024);
        let (_server_reader, writer) = split_pipe(server);
        let (mut reader, _client_writer) = split_pipe(client);

        let id = CorrelationId::new();
        let connection = CancellationToken::new();
        dispatcher.dispatch(id, line.to_string(), writer, &connection).unwrap();
        if let Some(delay) = cancel_after {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                dispatcher.cancel(id);
            });
        }

        let mut chunks = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), reader.next())
                .await
                .expect("timeout")
                .expect("stream open")
                .expect("valid frame");
            match msg {
                Message::CommandResponse { chunks: c, status, .. } => {
                    chunks.extend(c);
                    if status.is_terminal() {
                        return (chunks, status);
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn ping_and_echo() {
        assert_eq!(run(info(), "ping", None).await, (vec!["pong".into()], ResponseStatus::Completed));
        assert_eq!(
            run(info(), "Echo hello world", None).await.0,
            vec!["hello world".to_string()]
        );
    }

    #[tokio::test]
    async fn help_lists_every_command() {
        let (lines, status) = run(info(), "help", None).await;
        assert_eq!(status, ResponseStatus::Completed);
        assert_eq!(lines.len(), 9);
        assert!(lines.iter().any(|l| l.starts_with("sleep")));
        assert!(lines.iter().any(|l| l.starts_with("help")));
    }

    #[tokio::test]
    async fn count_streams_in_order() {
        let (lines, status) = run(info(), "count 250", None).await;
        assert_eq!(status, ResponseStatus::Completed);
        assert_eq!(lines.len(), 250);
        assert_eq!(lines.first().map(String::as_str), Some("1"));
        assert_eq!(lines.last().map(String::as_str), Some("250"));
    }

    #[tokio::test]
    async fn sleep_is_cancellable() {
        let (lines, status) = run(info(), "sleep 30", Some(Duration::from_millis(50))).await;
        assert!(lines.is_empty());
        assert_eq!(status, ResponseStatus::Cancelled);
    }

    #[tokio::test]
    async fn bad_arguments_and_fail_fault() {
        let (_, status) = run(info(), "sleep soon", None).await;
        assert!(matches!(status, ResponseStatus::Faulted(msg) if msg.contains("not a valid")));
        assert_eq!(
            run(info(), "fail out of coffee", None).await.1,
            ResponseStatus::Faulted("out of coffee".into())
        );
    }

    #[tokio::test]
    async fn logs_and_status_report_the_store() {
        let info = info();
        info.logs.record(LogRecord::new(LogLevel::Info, "host", "listening"));

        let (lines, _) = run(Arc::clone(&info), "logs 60", None).await;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("listening"));

        let (lines, _) = run(info, "status", None).await;
        let json: serde_json::Value = serde_json::from_str(&lines.join("\n")).unwrap();
        assert_eq!(json["service"], "jobs");
        assert_eq!(json["log_records"], 1);
        assert_eq!(json["commands"], 9);
    }

    #[tokio::test]
    async fn logs_window_out_of_range() {
        let info = info();
        info.logs.record(LogRecord::new(LogLevel::Warn, "host", "disk almost full"));

        let (_, status) = run(Arc::clone(&info), "logs 18446744073709551615", None).await;
        assert!(matches!(status, ResponseStatus::Faulted(msg) if msg.contains("out of range")));

        let (lines, status) = run(info, "logs 100000000000000000", None).await;
        assert_eq!(status, ResponseStatus::Completed);
        assert_eq!(lines.len(), 1);
    }
}
