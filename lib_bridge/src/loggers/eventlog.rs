use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::logentry::{LogEntry, LogStatus};
use crate::configs::settings::TransportMode;
use crate::connections::store::Row;
use crate::core::clock::{Clock, SystemClock};

/// # Event Log
///
/// Cheaply cloneable emitter for `LogEntry` values.
///
/// Every entry is written to `tracing` at the matching level and, when a
/// sink is attached, queued as an api-log row for the bridge's writer task.
/// Emission never blocks and never fails: a closed sink only loses the
/// store copy, the `tracing` copy is already out.
#[derive(Clone)]
pub struct EventLog {
    mode: TransportMode,
    clock: Arc<dyn Clock>,
    sink: Option<mpsc::UnboundedSender<Row>>,
    /// Micros since epoch of the last emitted entry, shared across clones.
    last_micros: Arc<AtomicI64>,
}

impl EventLog {
    /// Creates an emitter that queues entries on `sink`.
    pub fn new(mode: TransportMode, clock: Arc<dyn Clock>, sink: mpsc::UnboundedSender<Row>) -> Self {
        Self {
            mode,
            clock,
            sink: Some(sink),
            last_micros: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    /// Creates an emitter that only writes to `tracing`.
    pub fn detached(mode: TransportMode) -> Self {
        Self {
            mode,
            clock: Arc::new(SystemClock),
            sink: None,
            last_micros: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Current time on the bridge clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn info(&self, message: impl Into<String>) -> LogEntry {
        self.emit(LogStatus::Info, message.into())
    }

    pub fn warning(&self, message: impl Into<String>) -> LogEntry {
        self.emit(LogStatus::Warning, message.into())
    }

    pub fn error(&self, message: impl Into<String>) -> LogEntry {
        self.emit(LogStatus::Error, message.into())
    }

    /// Builds, mirrors, and queues one entry. Returns the entry as emitted.
    pub fn emit(&self, status: LogStatus, message: String) -> LogEntry {
        let entry = LogEntry {
            timestamp: self.next_timestamp(),
            mode: self.mode,
            message,
            status,
        };

        match status {
            LogStatus::Info => tracing::info!(mode = %entry.mode, "{}", entry.message),
            LogStatus::Warning => tracing::warn!(mode = %entry.mode, "{}", entry.message),
            LogStatus::Error => tracing::error!(mode = %entry.mode, "{}", entry.message),
        }

        if let Some(sink) = &self.sink {
            if sink.send(Row::Log(entry.clone())).is_err() {
                tracing::debug!("event sink closed; entry kept in tracing only");
            }
        }
        entry
    }

    /// Wall-clock time, bumped by 1µs when it would not advance past the
    /// previous entry.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let wall = self.clock.now().timestamp_micros();
        let mut prev = self.last_micros.load(Ordering::SeqCst);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match self.last_micros.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(|| self.clock.now()),
                Err(actual) => prev = actual,
            }
        }
    }
}
