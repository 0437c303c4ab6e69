//! # Loggers
//!
//! The bridge's user-visible surface is its log-entry stream. Entries are
//! mirrored to `tracing` immediately and queued for the api-log table.

/// Defines the `LogEntry` record and its status levels.
pub mod logentry;
/// Emits `LogEntry` values with monotonic timestamps.
pub mod eventlog;
