//! Forwarding of daemon log events to authenticated sessions.
//!
//! `LogForwarder` is a `tracing_subscriber` layer that republishes every
//! INFO-and-above event on a broadcast channel. Each authenticated session
//! runs a `forward` task that pushes those records as `log` messages.
//!
//! Nothing on the forwarding path may log at INFO or above.

use std::fmt::{self, Write as _};

use admin_core::protocol::messages::{LogRecord, names};
use admin_core::transport::Transport;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Records buffered per subscriber before the slowest one starts losing them.
pub const LOG_BUFFER: usize = 256;

#[derive(Clone)]
pub struct LogForwarder {
    tx: broadcast::Sender<LogRecord>,
}

impl LogForwarder {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOG_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.tx.subscribe()
    }
}

impl Default for LogForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogForwarder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::INFO || self.tx.receiver_count() == 0 {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let stack = format!(
            "{} {}:{}",
            metadata.target(),
            metadata.file().unwrap_or("<unknown>"),
            metadata.line().unwrap_or(0)
        );
        let _ = self.tx.send(LogRecord {
            message: format!("{} {}{}", metadata.level(), visitor.message, visitor.fields),
            stack: Some(stack),
        });
    }
}

/// Push every forwarded record to `connection` until it closes.
pub fn forward(mut logs: broadcast::Receiver<LogRecord>, connection: Transport) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let record = tokio::select! {
                record = logs.recv() => record,
                _ = connection.closed() => break,
            };
            match record {
                Ok(record) => {
                    if connection.send_json(names::LOG, &record).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
