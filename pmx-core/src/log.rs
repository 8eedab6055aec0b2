//! Log records carried by `LogResponse` pushes, and the query interface
//! the server uses to fetch them.
//!
//! The protocol only transports records. [`MemoryLogStore`] is a bounded
//! ring buffer good enough for a single host process.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.pad(s)
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// A single log line produced by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            target: target.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>5} {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.target,
            self.message
        )
    }
}

// ── LogSource ────────────────────────────────────────────────────

/// Retrieval API for service logs.
pub trait LogSource: Send + Sync {
    /// Records strictly newer than `since`, oldest first. `None` returns
    /// everything retained.
    fn query(&self, since: Option<DateTime<Utc>>) -> Vec<LogRecord>;

    /// Live feed of records as they are produced.
    fn subscribe(&self) -> broadcast::Receiver<LogRecord>;
}

// ── MemoryLogStore ───────────────────────────────────────────────

/// Bounded in-memory [`LogSource`].
pub struct MemoryLogStore {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    live: broadcast::Sender<LogRecord>,
}

impl MemoryLogStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (live, _) = broadcast::channel(capacity.min(4096));
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            live,
        }
    }

    /// Append a record, evicting the oldest one past capacity.
    pub fn record(&self, record: LogRecord) {
        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record.clone());
        }
        // No subscribers is fine.
        let _ = self.live.send(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LogSource for MemoryLogStore {
    fn query(&self, since: Option<DateTime<Utc>>) -> Vec<LogRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| since.is_none_or(|t| r.timestamp > t))
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.live.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record_at(offset_secs: i64, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            level: LogLevel::Info,
            target: "test".into(),
            message: message.into(),
        }
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let store = MemoryLogStore::new(2);
        store.record(record_at(0, "a"));
        store.record(record_at(1, "b"));
        store.record(record_at(2, "c"));

        let messages: Vec<_> = store.query(None).into_iter().map(|r| r.message).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn query_since_is_exclusive() {
        let store = MemoryLogStore::new(8);
        let first = record_at(-10, "old");
        let cutoff = first.timestamp;
        store.record(first);
        store.record(record_at(0, "new"));

        let newer = store.query(Some(cutoff));
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].message, "new");
    }

    #[tokio::test]
    async fn subscribers_see_new_records() {
        let store = MemoryLogStore::new(8);
        let mut rx = store.subscribe();
        store.record(LogRecord::new(LogLevel::Warn, "host", "disk almost full"));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.level, LogLevel::Warn);
        assert_eq!(got.message, "disk almost full");
    }

    #[test]
    fn level_from_tracing() {
        assert_eq!(LogLevel::from(tracing::Level::ERROR), LogLevel::Error);
        assert!(LogLevel::Warn > LogLevel::Info);
    }
}
