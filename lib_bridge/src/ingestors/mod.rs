//! # Transport Clients
//!
//! The upstream trading-data source is reached through one of two
//! capability-equivalent clients, picked once at start-up:
//!
//! - **`session_wss`**: a persistent WebSocket session to the local gateway.
//! - **`portal_polling`**: request/response polling against the REST portal.
//!
//! Both implement `TransportClient`. Each owns its `ConnectionState`; the
//! watchdog and scheduler only ever ask them to `connect`/`disconnect`.
//! Neither retries a failed connect on its own, retry policy belongs to
//! the watchdog.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::configs::settings::TransportMode;
use crate::loggers::eventlog::EventLog;
use crate::markets::aggregator::aggregate;
use crate::markets::greeks::{PortfolioSnapshot, Position};

#[cfg(feature = "ingestors")]
pub mod portal_polling;
#[cfg(feature = "ingestors")]
pub mod session_wss;

#[cfg(feature = "ingestors")]
pub use portal_polling::{PortalClient, PortalConfig};
#[cfg(feature = "ingestors")]
pub use session_wss::{SessionClient, SessionConfig};

/// Errors surfaced by a transport client.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Unexpected response: {0}")]
    Protocol(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport is not connected")]
    NotConnected,
}

/// Connection state as owned by the active transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub mode: TransportMode,
    pub connected: bool,
    pub last_error: Option<String>,
}

/// Interior-mutable `ConnectionState` shared between a client and its
/// background tasks.
#[derive(Debug)]
pub(crate) struct ConnectionCell {
    inner: RwLock<ConnectionState>,
}

#[allow(dead_code)]
impl ConnectionCell {
    pub(crate) fn new(mode: TransportMode) -> Self {
        Self {
            inner: RwLock::new(ConnectionState {
                mode,
                connected: false,
                last_error: None,
            }),
        }
    }

    pub(crate) async fn snapshot(&self) -> ConnectionState {
        self.inner.read().await.clone()
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.inner.read().await.connected
    }

    pub(crate) async fn mark_connected(&self) {
        let mut state = self.inner.write().await;
        state.connected = true;
        state.last_error = None;
    }

    /// Flips to disconnected. Returns whether the state actually changed.
    pub(crate) async fn mark_disconnected(&self, error: Option<String>) -> bool {
        let mut state = self.inner.write().await;
        let was_connected = state.connected;
        state.connected = false;
        if error.is_some() {
            state.last_error = error;
        }
        was_connected
    }
}

/// The capability both upstream transports provide.
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Event emitter this client reports lifecycle and degradation on.
    fn events(&self) -> &EventLog;

    /// Opens the session. On failure the state stays `connected = false`
    /// and `last_error` holds the reason; no retry happens here.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    /// Liveness check. May touch the network for request/response transports.
    async fn is_connected(&self) -> bool;

    async fn connection_state(&self) -> ConnectionState;

    /// Current positions. Options carry per-unit greeks where the source
    /// populated them within the greeks timeout, `None` otherwise.
    async fn fetch_positions(&self) -> Result<Vec<Position>, TransportError>;

    /// Fetches positions and reduces them to one portfolio snapshot.
    ///
    /// Positions whose greeks did not populate contribute zero and are
    /// reported as a `warning` entry.
    async fn get_portfolio_greeks(&self) -> Result<PortfolioSnapshot, TransportError> {
        let positions = self.fetch_positions().await?;
        let aggregation = aggregate(&positions, self.events().now());
        if aggregation.is_degraded() {
            self.events().warning(format!(
                "greeks missing for {} of {} positions, counted as zero: {}",
                aggregation.missing_greeks.len(),
                positions.len(),
                aggregation.missing_greeks.join(", ")
            ));
        }
        Ok(aggregation.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_cell_tracks_transitions() {
        let cell = ConnectionCell::new(TransportMode::Portal);
        assert!(!cell.is_connected().await);

        cell.mark_connected().await;
        assert!(cell.is_connected().await);

        assert!(cell.mark_disconnected(Some("reset by peer".to_string())).await);
        assert!(!cell.mark_disconnected(None).await);
        let state = cell.snapshot().await;
        assert_eq!(state.last_error.as_deref(), Some("reset by peer"));
        assert_eq!(state.mode, TransportMode::Portal);

        cell.mark_connected().await;
        assert_eq!(cell.snapshot().await.last_error, None);
    }
}
