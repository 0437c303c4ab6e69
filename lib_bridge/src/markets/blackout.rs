//! # Blackout Window
//!
//! The upstream source resets itself once a day. During that window a
//! dropped session is expected and reconnecting is pointless, so the
//! watchdog asks this module whether "now" is inside the window and when
//! it is worth trying again.

use chrono::{DateTime, Days, NaiveDateTime, TimeZone, Utc};
use std::cmp::Ordering;

use crate::configs::settings::BlackoutSettings;

/// Time-zone aware daily maintenance window.
#[derive(Debug, Clone)]
pub struct BlackoutWindow {
    settings: BlackoutSettings,
}

impl BlackoutWindow {
    pub fn new(settings: BlackoutSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BlackoutSettings {
        &self.settings
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.window_end(now).is_some()
    }

    /// The UTC instant the current window closes, if `now` is inside one.
    ///
    /// The window is `[start, end)` in local time. `start == end` disables it.
    pub fn window_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let BlackoutSettings { time_zone, start, end, .. } = &self.settings;
        let local = now.with_timezone(time_zone).naive_local();
        let (date, time) = (local.date(), local.time());

        let end_date = match start.cmp(end) {
            Ordering::Less => (time >= *start && time < *end).then_some(date),
            Ordering::Greater if time >= *start => date.checked_add_days(Days::new(1)),
            Ordering::Greater => (time < *end).then_some(date),
            Ordering::Equal => None,
        }?;

        Some(self.to_utc(end_date.and_time(*end)))
    }

    /// The instant to sleep toward before reconnecting: window end plus the
    /// resume grace. `None` when `now` is outside the window.
    pub fn resume_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let grace = chrono::Duration::from_std(self.settings.resume_grace).unwrap_or(chrono::Duration::zero());
        self.window_end(now).map(|end| end + grace)
    }

    /// Resolves a local wall time to UTC, stepping forward an hour when it
    /// falls in a DST gap.
    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let tz = self.settings.time_zone;
        tz.from_local_datetime(&local)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(local + chrono::Duration::hours(1))).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| local.and_utc())
    }
}
