//! Event logger
//! Writes every record to stderr and republishes it as a [`LogMessage`] to
//! subscribers, which the adaptor uses for deep logging.

use std::sync::OnceLock;

use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::core::bluetooth::{EventHub, Subscription};

static LOGGER: OnceLock<EventLogger> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: String,
    pub target: String,
    pub message: String,
    pub timestamp: String,
}

impl LogMessage {
    /// Whether the record came from this crate
    pub fn is_own(&self) -> bool {
        self.target.starts_with(env!("CARGO_CRATE_NAME"))
    }
}

pub struct EventLogger {
    level: Level,
    events: EventHub<LogMessage>,
}

impl EventLogger {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            events: EventHub::new(),
        }
    }

    /// Installs the logger process-wide
    pub fn init(level: Level) -> Result<(), SetLoggerError> {
        let logger = LOGGER.get_or_init(|| EventLogger::new(level));
        log::set_logger(logger).map(|()| log::set_max_level(logger.level.to_level_filter()))
    }

    /// Subscribes to the installed logger. `None` if [`init`](Self::init) never ran.
    pub fn subscribe_global() -> Option<(Subscription, UnboundedReceiver<LogMessage>)> {
        LOGGER.get().map(EventLogger::subscribe)
    }

    pub fn subscribe(&self) -> (Subscription, UnboundedReceiver<LogMessage>) {
        self.events.subscribe()
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };
        self.events.publish(log_message);
    }
}

impl log::Log for EventLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}
