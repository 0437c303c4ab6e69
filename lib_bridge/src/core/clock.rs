//! # Wall Clock
//!
//! Wall-clock reads go through `Clock` so blackout and timestamp logic can
//! run against the tokio timer in tests.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Time remaining until `target`, zero if it is already past.
    fn until(&self, target: DateTime<Utc>) -> Duration {
        (target - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// The operating-system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to `base` at construction that advances with
/// `tokio::time`, so paused-time tests see wall time move when the runtime
/// auto-advances.
#[derive(Debug, Clone)]
pub struct AnchoredClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl AnchoredClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or(chrono::Duration::zero());
        self.base + elapsed
    }
}
