//! Breaker state machine without I/O. `CircuitBreaker` drives it and
//! performs the side effects each transition implies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether writes go straight to the store or to the offline buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Writes go straight through.
    Closed,
    /// Writes are buffered; the flush timer probes for recovery.
    Open,
    /// A flush is in flight.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    WriteSucceeded,
    WriteFailed,
    /// The flush timer fired while `Open`.
    FlushStarted,
    FlushSucceeded,
    /// The store rejected a drained record or the probe.
    FlushFailed,
    /// The flush stopped for a reason unrelated to store health.
    FlushAbandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerMachine {
    state: BreakerState,
    consecutive_failures: u32,
    threshold: u32,
}

impl BreakerMachine {
    /// A fresh machine in `Closed`. A threshold of zero is treated as one.
    pub fn new(threshold: u32) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    /// Machine for a process that found `pending` records left in the buffer
    /// by a previous run. Any pending record resumes the `Open` condition.
    pub fn resumed(threshold: u32, pending: bool) -> Self {
        let mut machine = Self::new(threshold);
        if pending {
            machine.state = BreakerState::Open;
        }
        machine
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Applies one event. Returns the transition if the state changed.
    pub fn apply(&mut self, event: BreakerEvent) -> Option<Transition> {
        use BreakerEvent::*;
        use BreakerState::*;

        let from = self.state;
        let to = match (from, event) {
            (Closed, WriteSucceeded) | (Closed, FlushSucceeded) => {
                self.consecutive_failures = 0;
                Closed
            }
            (Closed, WriteFailed) | (Closed, FlushFailed) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.threshold {
                    Open
                } else {
                    Closed
                }
            }
            (Open, FlushStarted) => HalfOpen,
            (HalfOpen, FlushSucceeded) => {
                self.consecutive_failures = 0;
                Closed
            }
            (HalfOpen, FlushFailed) | (HalfOpen, FlushAbandoned) => Open,
            (state, _) => state,
        };

        self.state = to;
        (from != to).then_some(Transition { from, to })
    }
}
