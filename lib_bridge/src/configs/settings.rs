//! # Bridge Settings
//!
//! The resolved configuration the bridge core runs on. Every duration and
//! threshold has a default matching production behaviour; callers override
//! only what they need.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while turning raw configuration values into settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Invalid transport mode '{0}' (expected 'socket' or 'portal')")]
    InvalidTransport(String),
    #[error("Unknown time zone '{0}'")]
    InvalidTimeZone(String),
    #[error("Invalid wall-clock time '{0}' (expected HH:MM)")]
    InvalidTime(String),
    #[error("Reconnect policy needs at least one delay and one attempt")]
    EmptyReconnectPolicy,
}

/// Which upstream transport the bridge drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportMode {
    /// Persistent WebSocket session to the local gateway.
    Socket,
    /// Request/response polling against the REST portal.
    Portal,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Socket => "SOCKET",
            TransportMode::Portal => "PORTAL",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socket" => Ok(TransportMode::Socket),
            "portal" => Ok(TransportMode::Portal),
            _ => Err(SettingsError::InvalidTransport(s.to_string())),
        }
    }
}

/// Backoff used by the watchdog within one disconnect episode.
///
/// The first attempt runs immediately; attempt `n` (n >= 2) waits
/// `delays[n - 2]`, repeating the last delay if the list is shorter than
/// the attempt cap.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub delays: Vec<Duration>,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>, max_attempts: u32) -> Result<Self, SettingsError> {
        if delays.is_empty() || max_attempts == 0 {
            return Err(SettingsError::EmptyReconnectPolicy);
        }
        Ok(Self { delays, max_attempts })
    }

    /// Delay to wait before the given 1-based attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.delays.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt as usize - 2).min(self.delays.len() - 1);
        self.delays[idx]
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delays: [2, 5, 10, 20].into_iter().map(Duration::from_secs).collect(),
            max_attempts: 5,
        }
    }
}

/// Daily maintenance window on the upstream source.
///
/// `start` and `end` are wall-clock times in `time_zone`; an `end` earlier
/// than `start` means the window wraps past midnight.
#[derive(Debug, Clone, PartialEq)]
pub struct BlackoutSettings {
    pub time_zone: Tz,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Extra wait after the window closes before the first reconnect.
    pub resume_grace: Duration,
}

impl BlackoutSettings {
    /// Builds blackout settings from raw strings (`"America/New_York"`, `"23:45"`).
    pub fn parse(time_zone: &str, start: &str, end: &str, resume_grace: Duration) -> Result<Self, SettingsError> {
        let tz = Tz::from_str(time_zone.trim()).map_err(|_| SettingsError::InvalidTimeZone(time_zone.to_string()))?;
        Ok(Self {
            time_zone: tz,
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
            resume_grace,
        })
    }
}

impl Default for BlackoutSettings {
    fn default() -> Self {
        Self {
            time_zone: chrono_tz::America::New_York,
            start: NaiveTime::from_hms_opt(23, 45, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(0, 45, 0).unwrap_or(NaiveTime::MIN),
            resume_grace: Duration::from_secs(120),
        }
    }
}

fn parse_hhmm(raw: &str) -> Result<NaiveTime, SettingsError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| SettingsError::InvalidTime(raw.to_string()))
}

/// Everything the bridge core needs to run.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub mode: TransportMode,
    pub snapshot_interval: Duration,
    pub watchdog_interval: Duration,
    pub flush_interval: Duration,
    /// Consecutive store failures that open the breaker.
    pub failure_threshold: u32,
    /// Upper bound on a single store write before it counts as failed.
    pub write_timeout: Duration,
    /// Append-only JSON-lines file holding writes pending delivery.
    pub buffer_path: PathBuf,
    pub reconnect: ReconnectPolicy,
    pub blackout: BlackoutSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            mode: TransportMode::Socket,
            snapshot_interval: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(30),
            flush_interval: Duration::from_secs(60),
            failure_threshold: 3,
            write_timeout: Duration::from_secs(5),
            buffer_path: PathBuf::from("./data/greeks_buffer.jsonl"),
            reconnect: ReconnectPolicy::default(),
            blackout: BlackoutSettings::default(),
        }
    }
}
