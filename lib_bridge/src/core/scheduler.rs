//! # Bridge Scheduler
//!
//! Start-up order is schema, buffer and breaker, then the first connect,
//! then the periodic loops:
//!
//! - **snapshot**: every `snapshot_interval`, reduce positions to one
//!   portfolio record and queue it.
//! - **watchdog**: every `watchdog_interval`, check liveness and reconnect.
//! - **flush**: every `flush_interval`, let the breaker drain or probe.
//! - **writer**: the single consumer of the write queue and the only caller
//!   of `PersistenceGateway::write`. A slow store only ever stalls this task.
//!
//! Shutdown lets each loop finish its current tick, disconnects the
//! transport, then drains whatever is still queued.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::breaker::BreakerState;
use super::circuit_breaker::CircuitBreaker;
use super::clock::Clock;
use super::gateway::{GatewayError, PersistenceGateway};
use super::offline_buffer::{BufferError, OfflineBuffer};
use super::watchdog::{Watchdog, WatchdogTick};
use crate::configs::settings::{BridgeSettings, SettingsError, TransportMode};
use crate::connections::schema::SchemaManager;
use crate::connections::store::{Row, RowStore, StoreError};
use crate::ingestors::{ConnectionState, TransportClient, TransportError};
use crate::loggers::eventlog::EventLog;
use crate::markets::blackout::BlackoutWindow;

/// Fatal start-up failures. Nothing after start-up is fatal.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Destination schema unavailable: {0}")]
    Schema(#[from] StoreError),
    #[error("Offline buffer unusable: {0}")]
    Buffer(#[from] BufferError),
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Transport is {actual} but the bridge is configured for {expected}")]
    ModeMismatch {
        expected: TransportMode,
        actual: TransportMode,
    },
}

/// Point-in-time view of the bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatus {
    pub connection: ConnectionState,
    pub breaker: BreakerState,
    pub pending: usize,
}

async fn status_of(transport: &dyn TransportClient, breaker: &CircuitBreaker) -> BridgeStatus {
    BridgeStatus {
        connection: transport.connection_state().await,
        breaker: breaker.state().await,
        pending: breaker.pending().await,
    }
}

/// A configured bridge that has not started yet.
pub struct Bridge {
    settings: BridgeSettings,
    store: Arc<dyn RowStore>,
    clock: Arc<dyn Clock>,
    events: EventLog,
    queue_tx: mpsc::UnboundedSender<Row>,
    queue_rx: mpsc::UnboundedReceiver<Row>,
}

impl Bridge {
    pub fn new(settings: BridgeSettings, store: Arc<dyn RowStore>, clock: Arc<dyn Clock>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let events = EventLog::new(settings.mode, clock.clone(), queue_tx.clone());
        Self {
            settings,
            store,
            clock,
            events,
            queue_tx,
            queue_rx,
        }
    }

    /// The event log wired to this bridge's write queue. Transports must be
    /// built with it so their entries reach the api-log table.
    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Runs start-up and launches the loops.
    ///
    /// A failed first connect is not fatal; the watchdog owns recovery.
    pub async fn start(self, transport: Arc<dyn TransportClient>) -> Result<BridgeHandle, BridgeError> {
        let Bridge {
            settings,
            store,
            clock,
            events,
            queue_tx,
            queue_rx,
        } = self;

        if transport.mode() != settings.mode {
            return Err(BridgeError::ModeMismatch {
                expected: settings.mode,
                actual: transport.mode(),
            });
        }

        let created = SchemaManager::new(store.clone()).ensure().await?;
        if created.is_empty() {
            info!("destination schema already in place");
        } else {
            let names: Vec<&str> = created.iter().map(|t| t.name()).collect();
            events.info(format!("created destination tables: {}", names.join(", ")));
        }

        let buffer = OfflineBuffer::open(&settings.buffer_path).await?;
        let breaker = Arc::new(
            CircuitBreaker::new(
                store,
                buffer,
                settings.failure_threshold,
                settings.write_timeout,
                events.clone(),
            )
            .await?,
        );
        let gateway = PersistenceGateway::new(breaker.clone());

        events.info(format!("bridge starting in {} mode", settings.mode));
        if let Err(e) = transport.connect().await {
            events.warning(format!("initial connect failed, watchdog takes over: {e}"));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let (stop_writer, stop_rx) = oneshot::channel();

        let writer = tokio::spawn(run_writer(gateway, queue_rx, stop_rx, events.clone()));

        let watchdog = Watchdog::new(
            transport.clone(),
            BlackoutWindow::new(settings.blackout.clone()),
            settings.reconnect.clone(),
            clock,
        );
        let loops = vec![
            tokio::spawn(run_snapshots(
                transport.clone(),
                queue_tx,
                settings.snapshot_interval,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(run_watchdog(
                watchdog,
                transport.clone(),
                breaker.clone(),
                settings.watchdog_interval,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(run_flush(breaker.clone(), settings.flush_interval, shutdown_tx.subscribe())),
        ];

        Ok(BridgeHandle {
            shutdown: shutdown_tx,
            loops,
            writer,
            stop_writer,
            transport,
            breaker,
        })
    }
}

/// A running bridge.
pub struct BridgeHandle {
    shutdown: broadcast::Sender<()>,
    loops: Vec<JoinHandle<()>>,
    writer: JoinHandle<()>,
    stop_writer: oneshot::Sender<()>,
    transport: Arc<dyn TransportClient>,
    breaker: Arc<CircuitBreaker>,
}

impl BridgeHandle {
    pub async fn status(&self) -> BridgeStatus {
        status_of(self.transport.as_ref(), &self.breaker).await
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Stops scheduling, waits for in-flight ticks, disconnects, and drains
    /// the write queue.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        for task in self.loops {
            if let Err(e) = task.await {
                error!(error = %e, "bridge loop ended abnormally");
            }
        }

        self.transport.disconnect().await;

        let _ = self.stop_writer.send(());
        if let Err(e) = self.writer.await {
            error!(error = %e, "writer task ended abnormally");
        }
        info!("bridge stopped");
    }
}

async fn run_snapshots(
    transport: Arc<dyn TransportClient>,
    queue: mpsc::UnboundedSender<Row>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => capture_snapshot(transport.as_ref(), &queue).await,
        }
    }
    debug!("snapshot loop stopped");
}

async fn capture_snapshot(transport: &dyn TransportClient, queue: &mpsc::UnboundedSender<Row>) {
    if !transport.connection_state().await.connected {
        debug!("transport down, snapshot skipped");
        return;
    }
    match transport.get_portfolio_greeks().await {
        Ok(snapshot) => {
            debug!(
                delta = snapshot.delta,
                gamma = snapshot.gamma,
                vega = snapshot.vega,
                theta = snapshot.theta,
                "portfolio snapshot captured"
            );
            if queue.send(Row::Snapshot(snapshot)).is_err() {
                warn!("write queue closed, snapshot dropped");
            }
        }
        // The transport has already recorded the failure and dropped its session.
        Err(e) => debug!(error = %e, "snapshot cycle failed"),
    }
}

async fn run_watchdog(
    watchdog: Watchdog,
    transport: Arc<dyn TransportClient>,
    breaker: Arc<CircuitBreaker>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                if watchdog.tick(&mut shutdown).await == WatchdogTick::Cancelled {
                    break;
                }
                let status = status_of(transport.as_ref(), &breaker).await;
                debug!(
                    connected = status.connection.connected,
                    breaker = %status.breaker,
                    pending = status.pending,
                    "bridge status"
                );
            }
        }
    }
    debug!("watchdog loop stopped");
}

async fn run_flush(breaker: Arc<CircuitBreaker>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => match breaker.flush().await {
                Ok(outcome) => debug!(?outcome, "flush tick"),
                Err(e) => error!(error = %e, "flush tick failed on the offline buffer"),
            },
        }
    }
    debug!("flush loop stopped");
}

async fn run_writer(
    gateway: PersistenceGateway,
    mut queue: mpsc::UnboundedReceiver<Row>,
    mut stop: oneshot::Receiver<()>,
    events: EventLog,
) {
    loop {
        tokio::select! {
            biased;
            row = queue.recv() => match row {
                Some(row) => persist(&gateway, &events, row).await,
                None => return,
            },
            _ = &mut stop => break,
        }
    }

    queue.close();
    while let Some(row) = queue.recv().await {
        persist(&gateway, &events, row).await;
    }
    debug!("write queue drained");
}

async fn persist(gateway: &PersistenceGateway, events: &EventLog, row: Row) {
    match gateway.write(row.table(), row).await {
        Ok(outcome) => trace!(?outcome, "row handled"),
        Err(GatewayError::InvariantViolation(reason)) => {
            events.error(format!("row rejected: {reason}"));
        }
        // Not an entry: it would hit the same broken buffer.
        Err(GatewayError::Buffer(e)) => error!(error = %e, "row lost, offline buffer unusable"),
    }
}
