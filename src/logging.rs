use std::sync::OnceLock;

use chrono::Local;
use log::{LevelFilter, Metadata, Record};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::logging_config::LoggingConfig;

const LOG_CHANNEL_CAPACITY: usize = 256;

static LOG_CHANNEL: OnceLock<broadcast::Sender<LogMessage>> = OnceLock::new();

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: String,
    pub target: String,
    pub message: String,
    pub timestamp: String,
}

fn channel() -> &'static broadcast::Sender<LogMessage> {
    LOG_CHANNEL.get_or_init(|| broadcast::channel(LOG_CHANNEL_CAPACITY).0)
}

/// Receives every record the [`LinkLogger`] forwards from now on
pub fn subscribe_logs() -> broadcast::Receiver<LogMessage> {
    channel().subscribe()
}

/// Logger writing to stderr and forwarding records to log subscribers
pub struct LinkLogger {
    level: LevelFilter,
}

impl LinkLogger {
    pub fn new(level: LevelFilter) -> Self {
        Self { level }
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage {
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };
        // nobody listening
        let _ = channel().send(log_message);
    }
}

impl log::Log for LinkLogger {
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

/// Installs the logger described by `config`.
///
/// Falls back to `env_logger` when forwarding is off or a logger is
/// already installed.
pub fn init(config: &LoggingConfig) {
    let level = config.level_filter();
    if config.forward_records {
        match log::set_boxed_logger(Box::new(LinkLogger::new(level))) {
            Ok(()) => {
                log::set_max_level(level);
                log::info!("Logging initialized at {}", level);
                return;
            }
            Err(e) => eprintln!("Failed to install link logger: {}", e),
        }
    }

    if env_logger::Builder::new()
        .filter_level(level)
        .try_init()
        .is_ok()
    {
        log::info!("Logging initialized at {}", level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn test_logger_respects_level() {
        let logger = LinkLogger::new(LevelFilter::Warn);
        let warn = Metadata::builder().level(log::Level::Warn).build();
        let debug = Metadata::builder().level(log::Level::Debug).build();
        assert!(logger.enabled(&warn));
        assert!(!logger.enabled(&debug));
    }

    #[test]
    fn test_records_are_forwarded() {
        let mut rx = subscribe_logs();
        let logger = LinkLogger::new(LevelFilter::Info);
        logger.log(
            &Record::builder()
                .level(log::Level::Info)
                .target("ble_printer_link::test")
                .args(format_args!("printer ready"))
                .build(),
        );

        let message = rx.try_recv().unwrap();
        assert_eq!(message.level, "INFO");
        assert_eq!(message.target, "ble_printer_link::test");
        assert_eq!(message.message, "printer ready");
        assert!(!message.timestamp.is_empty());
    }
}
