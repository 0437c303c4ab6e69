//! # Circuit Breaker
//!
//! Owns the breaker state and the offline buffer, and is the only caller of
//! `RowStore::insert`. Writes never surface a store failure: a failed or
//! skipped write lands in the buffer and the flush timer replays it later,
//! oldest first.
//!
//! Transitions come from `BreakerMachine`; this type performs the I/O and
//! reports each transition on the event log.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::breaker::{BreakerEvent, BreakerMachine, BreakerState, Transition};
use super::offline_buffer::{BufferError, BufferedLine, BufferedRecord, OfflineBuffer};
use crate::connections::store::{Row, RowStore, StoreError};
use crate::loggers::eventlog::EventLog;

/// What happened to a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    Buffered,
}

/// Result of one flush tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Breaker closed and nothing pending.
    Idle,
    /// The store accepted the probe or every pending record.
    Recovered { drained: usize },
    /// The store failed mid-drain; the rest stays buffered.
    Failed { drained: usize },
    /// A corrupt line was quarantined and the tick given up.
    Abandoned { drained: usize },
}

struct Inner {
    machine: BreakerMachine,
    /// Lines in the buffer file, kept in step with every append and removal.
    pending: usize,
}

pub struct CircuitBreaker {
    store: Arc<dyn RowStore>,
    buffer: OfflineBuffer,
    inner: Mutex<Inner>,
    /// One flush at a time; held for the whole drain.
    flushing: Mutex<()>,
    write_timeout: Duration,
    events: EventLog,
}

impl CircuitBreaker {
    /// Builds the breaker over an opened buffer. A non-empty buffer means a
    /// previous run ended while the store was unreachable, so the breaker
    /// starts `Open`.
    pub async fn new(
        store: Arc<dyn RowStore>,
        buffer: OfflineBuffer,
        failure_threshold: u32,
        write_timeout: Duration,
        events: EventLog,
    ) -> Result<Self, BufferError> {
        let pending = buffer.len().await?;
        if pending > 0 {
            events.warning(format!(
                "{pending} buffered writes left by a previous run, breaker starts OPEN"
            ));
        }
        Ok(Self {
            store,
            buffer,
            inner: Mutex::new(Inner {
                machine: BreakerMachine::resumed(failure_threshold, pending > 0),
                pending,
            }),
            flushing: Mutex::new(()),
            write_timeout,
            events,
        })
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.machine.state()
    }

    /// Records waiting in the buffer.
    pub async fn pending(&self) -> usize {
        self.inner.lock().await.pending
    }

    pub fn buffer(&self) -> &OfflineBuffer {
        &self.buffer
    }

    async fn insert(&self, row: &Row) -> Result<(), StoreError> {
        match timeout(self.write_timeout, self.store.insert(row)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.write_timeout)),
        }
    }

    async fn probe(&self) -> Result<(), StoreError> {
        match timeout(self.write_timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.write_timeout)),
        }
    }

    /// Persists `row` directly while the breaker is closed, otherwise
    /// appends it to the buffer. A failed direct write is buffered too and
    /// counts toward the failure threshold.
    pub async fn write(&self, row: Row) -> Result<WriteOutcome, BufferError> {
        if self.state().await != BreakerState::Closed {
            self.buffer_row(&row, None).await?;
            return Ok(WriteOutcome::Buffered);
        }

        match self.insert(&row).await {
            Ok(()) => {
                self.inner.lock().await.machine.apply(BreakerEvent::WriteSucceeded);
                Ok(WriteOutcome::Stored)
            }
            Err(e) => {
                let transition = self.buffer_row(&row, Some(BreakerEvent::WriteFailed)).await?;
                if let Some(t) = transition {
                    self.events.warning(format!("store writes keep failing, breaker {t}: {e}"));
                } else {
                    warn!(table = %row.table(), error = %e, "store write failed, row buffered");
                }
                Ok(WriteOutcome::Buffered)
            }
        }
    }

    /// Appends under the state lock so `pending` and the file agree, and
    /// applies `event` in the same critical section.
    async fn buffer_row(&self, row: &Row, event: Option<BreakerEvent>) -> Result<Option<Transition>, BufferError> {
        let record = BufferedRecord::from_row(row)?;
        let (pending, transition) = {
            let mut inner = self.inner.lock().await;
            let appended = self.buffer.append(&record).await;
            // A failed sync can still leave the line on disk.
            inner.pending = self.buffer.len().await?;
            appended?;
            let transition = event.and_then(|e| inner.machine.apply(e));
            (inner.pending, transition)
        };

        match row {
            Row::Snapshot(snapshot) => {
                self.events.warning(format!(
                    "store unavailable, snapshot {} buffered ({pending} pending)",
                    snapshot.timestamp.to_rfc3339()
                ));
            }
            // Reporting a buffered log row as a log entry would feed itself.
            Row::Log(_) => debug!(pending, "api-log row buffered"),
        }
        Ok(transition)
    }

    /// One flush tick.
    ///
    /// `Open` moves to `HalfOpen` and either drains the buffer or, when it is
    /// empty, pings the store. Success closes the breaker, failure reopens it.
    /// A closed breaker with pending records drains without changing state.
    /// The line count of the file is taken as `pending` on every tick.
    pub async fn flush(&self) -> Result<FlushOutcome, BufferError> {
        let _flushing = self.flushing.lock().await;

        let (started, pending) = {
            let mut inner = self.inner.lock().await;
            inner.pending = self.buffer.len().await?;
            match inner.machine.state() {
                BreakerState::Closed if inner.pending == 0 => return Ok(FlushOutcome::Idle),
                BreakerState::Closed => (None, inner.pending),
                _ => (inner.machine.apply(BreakerEvent::FlushStarted), inner.pending),
            }
        };
        if let Some(t) = started {
            self.events.info(format!("breaker {t}, retrying store with {pending} pending"));
        }

        if pending == 0 {
            return Ok(self.probe_store().await);
        }
        self.drain().await
    }

    async fn probe_store(&self) -> FlushOutcome {
        match self.probe().await {
            Ok(()) => {
                let transition = self.inner.lock().await.machine.apply(BreakerEvent::FlushSucceeded);
                if let Some(t) = transition {
                    self.events.info(format!("store reachable again, breaker {t}"));
                }
                FlushOutcome::Recovered { drained: 0 }
            }
            Err(e) => {
                let transition = self.inner.lock().await.machine.apply(BreakerEvent::FlushFailed);
                if let Some(t) = transition {
                    self.events.warning(format!("store probe failed, breaker {t}: {e}"));
                }
                FlushOutcome::Failed { drained: 0 }
            }
        }
    }

    /// Replays the buffer oldest first. Acknowledged records leave the file
    /// in one rewrite per pass, and only up to the first record the store
    /// refused or the first corrupt line.
    async fn drain(&self) -> Result<FlushOutcome, BufferError> {
        let mut drained = 0;
        loop {
            let mut acked = 0;
            let mut stopped = None;
            for line in self.buffer.read_all().await? {
                match line {
                    BufferedLine::Record(row) => match self.insert(&row).await {
                        Ok(()) => acked += 1,
                        Err(e) => {
                            stopped = Some(DrainStop::Refused(e));
                            break;
                        }
                    },
                    BufferedLine::Corrupt(raw) => {
                        stopped = Some(DrainStop::Corrupt(raw));
                        break;
                    }
                }
            }
            let remaining = self.acknowledge(acked).await?;
            drained += acked;

            match stopped {
                Some(DrainStop::Refused(e)) => {
                    let transition = self.inner.lock().await.machine.apply(BreakerEvent::FlushFailed);
                    let message =
                        format!("flush stopped after {drained} records, {remaining} still buffered: {e}");
                    if let Some(t) = transition {
                        self.events.warning(format!("{message}; breaker {t}"));
                    } else {
                        self.events.warning(message);
                    }
                    return Ok(FlushOutcome::Failed { drained });
                }
                Some(DrainStop::Corrupt(raw)) => {
                    self.quarantine().await?;
                    self.events.error(format!(
                        "corrupt buffer entry moved to {}: {}",
                        self.buffer.corrupt_path().display(),
                        raw.chars().take(120).collect::<String>()
                    ));
                    return Ok(FlushOutcome::Abandoned { drained });
                }
                None => {}
            }

            // Rows buffered while draining are picked up on the next pass.
            let transition = {
                let mut inner = self.inner.lock().await;
                inner.pending = self.buffer.len().await?;
                if inner.pending > 0 {
                    continue;
                }
                inner.machine.apply(BreakerEvent::FlushSucceeded)
            };
            if let Some(t) = transition {
                self.events.info(format!("drained {drained} buffered writes, breaker {t}"));
            } else {
                self.events.info(format!("drained {drained} buffered writes"));
            }
            return Ok(FlushOutcome::Recovered { drained });
        }
    }

    /// Removes `acked` records from the front and resyncs `pending`.
    /// Returns the records left.
    async fn acknowledge(&self, acked: usize) -> Result<usize, BufferError> {
        let mut inner = self.inner.lock().await;
        inner.pending = self.buffer.remove_front(acked).await?;
        Ok(inner.pending)
    }

    async fn quarantine(&self) -> Result<(), BufferError> {
        let mut inner = self.inner.lock().await;
        self.buffer.quarantine_front().await?;
        inner.pending = self.buffer.len().await?;
        inner.machine.apply(BreakerEvent::FlushAbandoned);
        Ok(())
    }
}

enum DrainStop {
    Refused(StoreError),
    Corrupt(String),
}
