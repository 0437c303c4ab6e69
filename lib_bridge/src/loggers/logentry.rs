use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::configs::settings::TransportMode;

/// # Log Status
///
/// Severity of a lifecycle event, stored verbatim in the api-log table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Info,
    Warning,
    Error,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Info => "info",
            LogStatus::Warning => "warning",
            LogStatus::Error => "error",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// # Log Entry
///
/// One notable lifecycle event: connect, disconnect, breaker transition,
/// buffer drain, degraded data. Append-only; never mutated once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Emission time (UTC), strictly increasing within one process.
    pub timestamp: DateTime<Utc>,
    /// Transport mode the bridge was running when the event happened.
    pub mode: TransportMode,
    pub message: String,
    pub status: LogStatus,
}
