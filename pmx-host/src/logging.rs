//! Tracing setup for the host, including the layer that feeds host log
//! events into the store pushed to connected consoles.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use pmx_core::log::{LogRecord, MemoryLogStore};

use crate::config::HostConfig;

/// Copies every event at or above `min_level` into a [`MemoryLogStore`].
pub struct LogCaptureLayer {
    store: Arc<MemoryLogStore>,
    min_level: Level,
}

impl LogCaptureLayer {
    pub fn new(store: Arc<MemoryLogStore>, min_level: Level) -> Self {
        Self { store, min_level }
    }
}

impl<S: Subscriber> Layer<S> for LogCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // Level ordering is inverted: TRACE > DEBUG > ... > ERROR.
        if *meta.level() > self.min_level {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.store.record(LogRecord::new(
            (*meta.level()).into(),
            meta.target(),
            visitor.finish(),
        ));
    }
}

/// Renders `message` followed by the remaining fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={value:?}", field.name());
    }
}

/// Install the global subscriber: formatted stderr output filtered by
/// `RUST_LOG` (falling back to the configured level) plus the capture
/// layer.
pub fn init(config: &HostConfig, store: Arc<MemoryLogStore>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(LogCaptureLayer::new(store, config.capture_level()))
        .init();
}
