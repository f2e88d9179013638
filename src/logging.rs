use chrono::Local;
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::mpsc;

/// A log record as forwarded to the host
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

impl LogMessage {
    fn from_record(record: &Record) -> Self {
        Self {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        }
    }
}

/// Writes records to stderr and optionally forwards them to the host bridge.
pub struct HostLogger {
    level: LevelFilter,
    forward: Option<mpsc::UnboundedSender<LogMessage>>,
}

impl HostLogger {
    pub fn new(level: LevelFilter, forward: Option<mpsc::UnboundedSender<LogMessage>>) -> Self {
        Self { level, forward }
    }

    pub fn init(
        level: LevelFilter,
        forward: Option<mpsc::UnboundedSender<LogMessage>>,
    ) -> Result<(), SetLoggerError> {
        let logger = HostLogger::new(level, forward);
        log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))
    }

    fn emit_log(&self, record: &Record) {
        let log_message = LogMessage::from_record(record);
        eprintln!(
            "[{} {} {}] {}",
            log_message.timestamp,
            log_message.level,
            record.target(),
            log_message.message
        );

        // Forwarding stops silently once the host side is gone.
        if let Some(forward) = &self.forward {
            let _ = forward.send(log_message);
        }
    }
}

impl log::Log for HostLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.emit_log(record);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Log};

    #[test]
    fn forwards_enabled_records_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = HostLogger::new(LevelFilter::Info, Some(tx));

        logger.log(
            &Record::builder()
                .args(format_args!("link lost"))
                .level(Level::Warn)
                .target("ble")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("callback detail"))
                .level(Level::Debug)
                .target("ble")
                .build(),
        );

        let forwarded = rx.try_recv().unwrap();
        assert_eq!(forwarded.level, "WARN");
        assert_eq!(forwarded.message, "link lost");
        assert!(!forwarded.timestamp.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_forwarding_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let logger = HostLogger::new(LevelFilter::Trace, Some(tx));
        logger.log(
            &Record::builder()
                .args(format_args!("still logged to stderr"))
                .level(Level::Error)
                .build(),
        );
    }

    #[test]
    fn log_message_serializes_flat() {
        let message = LogMessage {
            level: "INFO".to_string(),
            message: "ready".to_string(),
            timestamp: "2024-01-01T00:00:00+00:00".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            serde_json::json!({
                "level": "INFO",
                "message": "ready",
                "timestamp": "2024-01-01T00:00:00+00:00",
            })
        );
    }
}
