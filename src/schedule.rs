//! Daily fire-time computation and the timers that deliver it
//!
//! A [`ScheduleSpec`] names one local time of day in one timezone. The
//! [`ScheduleClock`] turns it into single-fire events pushed onto the
//! dispatcher's channel, re-arming for the following day after each fire.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

static SEND_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{1,2}):(\d{2})\s*$").expect("Invalid send time regex"));

/// Hour and minute of the daily fire, in a fixed timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub hour: u32,
    pub minute: u32,
    pub timezone: Tz,
}

impl ScheduleSpec {
    pub fn new(hour: u32, minute: u32, timezone: Tz) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(Error::Schedule(format!(
                "time of day out of range: {:02}:{:02}",
                hour, minute
            )));
        }
        Ok(Self {
            hour,
            minute,
            timezone,
        })
    }

    /// Parse "HH:MM" plus an IANA zone name such as "Europe/Kyiv"
    pub fn parse(send_time: &str, timezone: &str) -> Result<Self> {
        let caps = SEND_TIME
            .captures(send_time)
            .ok_or_else(|| Error::Schedule(format!("sendTime must be HH:MM, got '{}'", send_time)))?;

        let hour: u32 = caps[1]
            .parse()
            .map_err(|_| Error::Schedule(format!("invalid hour in '{}'", send_time)))?;
        let minute: u32 = caps[2]
            .parse()
            .map_err(|_| Error::Schedule(format!("invalid minute in '{}'", send_time)))?;

        let tz: Tz = timezone
            .trim()
            .parse()
            .map_err(|e| Error::Schedule(format!("unknown timezone '{}': {}", timezone, e)))?;

        Self::new(hour, minute, tz)
    }

    /// Local midnight in the given zone, used for the daily reset
    pub fn midnight(timezone: Tz) -> Self {
        Self {
            hour: 0,
            minute: 0,
            timezone,
        }
    }

    /// Calendar date of `instant` in this schedule's zone
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.timezone).date_naive()
    }

    /// The fire instant belonging to a local calendar date.
    ///
    /// Ambiguous local times (clocks going back) resolve to the earlier
    /// instant. Local times inside a DST gap resolve to the first valid
    /// minute after the gap.
    pub fn fire_on(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date.and_hms_opt(self.hour, self.minute, 0).unwrap_or_default();
        if let Some(instant) = self.resolve_local(naive) {
            return instant;
        }

        for minutes in 1..=24 * 60 {
            if let Some(instant) = self.resolve_local(naive + ChronoDuration::minutes(minutes)) {
                return instant;
            }
        }

        Utc.from_utc_datetime(&naive)
    }

    fn resolve_local(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.timezone.from_local_datetime(&naive) {
            LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => None,
        }
    }

    /// Earliest fire instant strictly after `now`.
    ///
    /// A fire instant equal to `now` counts as consumed, so feeding the
    /// result back in advances exactly one local day.
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = self.local_date(now);
        let candidate = self.fire_on(today);
        if candidate > now {
            return candidate;
        }
        match today.succ_opt() {
            Some(tomorrow) => self.fire_on(tomorrow),
            None => candidate,
        }
    }
}

impl std::fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02} {}", self.hour, self.minute, self.timezone)
    }
}

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Tokio instant at which the wall clock is expected to read `at`
    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let wait = (at - self.now()).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + wait
    }
}

/// The host's clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time anchored at a fixed instant and advanced by tokio's clock.
///
/// Under `tokio::time::pause` this clock moves only when tokio time does,
/// which makes day-long schedules testable in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    wall: DateTime<Utc>,
    start: Instant,
}

impl MonotonicClock {
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = ChronoDuration::from_std(Instant::now() - self.start)
            .unwrap_or_else(|_| ChronoDuration::zero());
        self.wall + elapsed
    }
}

/// Armed daily triggers feeding a single consumer channel
pub struct ScheduleClock {
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ScheduleClock {
    pub fn new(clock: Arc<dyn Clock>, parent: &CancellationToken) -> Self {
        Self {
            clock,
            cancel: parent.child_token(),
            tasks: Vec::new(),
        }
    }

    /// Deliver `event` at every daily fire instant of `spec`
    pub fn arm<E>(&mut self, spec: ScheduleSpec, tx: mpsc::Sender<E>, event: E)
    where
        E: Clone + Send + 'static,
    {
        let clock = self.clock.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut target = spec.next_fire_after(clock.now());
            loop {
                debug!("Next fire for {} at {}", spec, target);

                // The wall clock can lag a monotonic sleep; re-check after every wake
                while clock.now() < target {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep_until(clock.instant_at(target)) => {}
                    }
                }

                if cancel.is_cancelled() || tx.send(event.clone()).await.is_err() {
                    return;
                }

                target = spec.next_fire_after(clock.now().max(target));
            }
        });

        self.tasks.push(handle);
    }

    /// Deliver `event` at every local midnight of `timezone`
    pub fn arm_daily_reset<E>(&mut self, timezone: Tz, tx: mpsc::Sender<E>, event: E)
    where
        E: Clone + Send + 'static,
    {
        self.arm(ScheduleSpec::midnight(timezone), tx, event);
    }

    /// Stop pending fires and all future re-arming
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ScheduleClock {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}
