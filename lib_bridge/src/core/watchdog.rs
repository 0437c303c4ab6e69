//! # Connection Watchdog
//!
//! Called once per watchdog tick. A connected transport is left alone. A
//! disconnected one is either reconnected with bounded backoff or, inside
//! the daily blackout window, left down until shortly after the window
//! closes. The deferral is one computed sleep, not a poll per tick.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::debug;

use super::clock::Clock;
use crate::configs::settings::ReconnectPolicy;
use crate::ingestors::TransportClient;
use crate::loggers::eventlog::EventLog;
use crate::markets::blackout::BlackoutWindow;

/// What one tick should do, given the connection flag and the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPlan {
    Healthy,
    /// Inside the blackout window: sleep until `until`, then reconnect.
    Defer { until: DateTime<Utc> },
    Reconnect,
}

pub fn plan(connected: bool, now: DateTime<Utc>, window: &BlackoutWindow) -> WatchdogPlan {
    if connected {
        return WatchdogPlan::Healthy;
    }
    match window.resume_at(now) {
        Some(until) => WatchdogPlan::Defer { until },
        None => WatchdogPlan::Reconnect,
    }
}

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTick {
    Healthy,
    Reconnected { attempts: u32 },
    /// Every attempt of the episode failed; the next tick starts over.
    Exhausted,
    /// Shutdown arrived while sleeping.
    Cancelled,
}

enum Episode {
    Connected(u32),
    /// The blackout window opened between attempts.
    BlackoutStarted,
    Exhausted,
    Cancelled,
}

/// Sleeps for `duration` unless shutdown arrives first. Returns `false` on
/// shutdown.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = sleep(duration) => true,
        _ = shutdown.recv() => false,
    }
}

pub struct Watchdog {
    transport: Arc<dyn TransportClient>,
    window: BlackoutWindow,
    policy: ReconnectPolicy,
    clock: Arc<dyn Clock>,
}

impl Watchdog {
    pub fn new(
        transport: Arc<dyn TransportClient>,
        window: BlackoutWindow,
        policy: ReconnectPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            window,
            policy,
            clock,
        }
    }

    fn events(&self) -> &EventLog {
        self.transport.events()
    }

    /// One watchdog tick.
    pub async fn tick(&self, shutdown: &mut broadcast::Receiver<()>) -> WatchdogTick {
        let connected = self.transport.is_connected().await;
        loop {
            match plan(connected, self.clock.now(), &self.window) {
                WatchdogPlan::Healthy => return WatchdogTick::Healthy,
                WatchdogPlan::Defer { until } => {
                    self.events().info(format!(
                        "transport down inside blackout window, reconnect deferred until {}",
                        until.to_rfc3339()
                    ));
                    if !sleep_or_shutdown(self.clock.until(until), shutdown).await {
                        return WatchdogTick::Cancelled;
                    }
                }
                WatchdogPlan::Reconnect => match self.reconnect(shutdown).await {
                    Episode::Connected(attempts) => return WatchdogTick::Reconnected { attempts },
                    Episode::Exhausted => return WatchdogTick::Exhausted,
                    Episode::Cancelled => return WatchdogTick::Cancelled,
                    Episode::BlackoutStarted => continue,
                },
            }
        }
    }

    /// One disconnect episode: up to `max_attempts` connects with the
    /// policy's delays between them. The window is re-checked before every
    /// attempt.
    async fn reconnect(&self, shutdown: &mut broadcast::Receiver<()>) -> Episode {
        let max = self.policy.max_attempts;
        for attempt in 1..=max {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!(attempt, delay_secs = delay.as_secs_f64(), "waiting before reconnect");
                if !sleep_or_shutdown(delay, shutdown).await {
                    return Episode::Cancelled;
                }
            }
            if self.window.contains(self.clock.now()) {
                return Episode::BlackoutStarted;
            }

            self.events().info(format!("reconnect attempt {attempt}/{max}"));
            match self.transport.connect().await {
                Ok(()) => {
                    self.events().info(format!("reconnected on attempt {attempt}/{max}"));
                    return Episode::Connected(attempt);
                }
                Err(e) => {
                    self.events().warning(format!("reconnect attempt {attempt}/{max} failed: {e}"));
                }
            }
        }
        self.events().error(format!(
            "reconnect gave up after {max} attempts, retrying on the next watchdog tick"
        ));
        Episode::Exhausted
    }
}
