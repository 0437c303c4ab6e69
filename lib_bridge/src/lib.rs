//! # lib_bridge
//!
//! The portfolio greeks bridge. It keeps a session with the trading-data
//! source open, reduces live positions to one portfolio-level greeks record
//! per cycle, and persists it without ever blocking the feed on the store.
//!
//! Folder modules, leaves first:
//! - **`configs`**: resolved settings handed to the bridge at start-up.
//! - **`loggers`**: the `LogEntry` event stream mirrored to `tracing`.
//! - **`markets`**: positions, greeks, the aggregator, and the blackout window.
//! - **`connections`**: the destination store seam and its PostgreSQL driver.
//! - **`retrieve`**: the retrying HTTP client used by the polling transport.
//! - **`ingestors`**: the two interchangeable transport clients.
//! - **`core`**: circuit breaker, offline buffer, gateway, watchdog, scheduler.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod connections;
pub mod core;
pub mod ingestors;
pub mod loggers;
pub mod markets;
#[cfg(feature = "ingestors")]
pub mod retrieve;

pub use configs::settings::{BlackoutSettings, BridgeSettings, ReconnectPolicy, TransportMode};
pub use connections::store::{Row, RowStore, StoreError, Table};
pub use core::breaker::BreakerState;
pub use core::circuit_breaker::{CircuitBreaker, FlushOutcome, WriteOutcome};
pub use core::clock::{AnchoredClock, Clock, SystemClock};
pub use core::gateway::{GatewayError, PersistenceGateway};
pub use core::offline_buffer::{BufferError, OfflineBuffer};
pub use core::scheduler::{Bridge, BridgeError, BridgeHandle, BridgeStatus};
pub use ingestors::{ConnectionState, TransportClient, TransportError};
pub use loggers::eventlog::EventLog;
pub use loggers::logentry::{LogEntry, LogStatus};
pub use markets::greeks::{Greeks, PortfolioSnapshot, Position, SecurityType, PORTFOLIO_CONTRACT};
