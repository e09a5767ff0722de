//! Calendar bucketing
//!
//! Maps arbitrary instants onto canonical bucket starts for each
//! [`Granularity`]. All calendar work happens on the local wall clock of the
//! configured timezone; results are re-expressed as UTC instants.
//!
//! # Algorithm
//!
//! Bucket starts are the grid points of the local wall clock (whole minutes,
//! hours, midnights, first days of months ..) mapped back to instants:
//!
//! ```text
//! single wall time     → that instant
//! inside a DST gap     → first instant that exists after it
//! repeated (fall-back) → the earlier instant, plus the later one when the
//!                        whole bucket elapses before the clock turns back
//! ```
//!
//! `truncate` is the latest start at or before the instant and `next` the
//! earliest start after it. Away from offset changes both reduce to flooring
//! the wall clock; within a few hours of a change the candidate starts around
//! the instant are enumerated and compared as instants, so an hour that
//! repeats on the wall clock yields two buckets.
//!
//! `step_g` is a fixed jump (60s, 1h, 1d, 7d, 31d, 93d, 372d) that always lands
//! inside the following bucket; re-flooring snaps it to the exact boundary.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc, Weekday};
//! use kuba_tally::time::{Granularity, TimeBucketer};
//!
//! let bucketer = TimeBucketer::new("UTC", Weekday::Mon);
//! let at = Utc.with_ymd_and_hms(2024, 5, 17, 13, 45, 12).unwrap();
//!
//! assert_eq!(
//!     bucketer.truncate(at, Granularity::Quarter),
//!     Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
//! );
//! ```

use super::Granularity;
use crate::key::BucketKey;
use chrono::{
    DateTime, Datelike, Days, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    Offset, TimeDelta, TimeZone, Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use tracing::warn;

/// Longest DST gap searched when a local time does not exist (one day, in minutes)
const MAX_GAP_MINUTES: u32 = 24 * 60;

/// Window around an instant within which a UTC offset change is looked for
const SETTLE_SECONDS: i64 = 3 * 60 * 60;

/// Converts instants into bucket boundaries for a timezone and week start
#[derive(Debug, Clone)]
pub struct TimeBucketer {
    tz: Tz,
    week_start: Weekday,
}

impl Default for TimeBucketer {
    fn default() -> Self {
        Self {
            tz: Tz::UTC,
            week_start: Weekday::Mon,
        }
    }
}

impl TimeBucketer {
    /// Create a bucketer for an IANA timezone name
    ///
    /// An unknown timezone never fails: it logs a warning and falls back to UTC.
    pub fn new(timezone: &str, week_start: Weekday) -> Self {
        let tz = match timezone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(e) => {
                warn!(
                    timezone = timezone,
                    error = %e,
                    "Unknown timezone, falling back to UTC"
                );
                Tz::UTC
            },
        };
        Self { tz, week_start }
    }

    /// Create a bucketer from an already resolved timezone
    pub fn with_timezone(tz: Tz, week_start: Weekday) -> Self {
        Self { tz, week_start }
    }

    /// Timezone used for wall-clock truncation
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// First day of the week for [`Granularity::Week`]
    pub fn week_start(&self) -> Weekday {
        self.week_start
    }

    /// Start of the bucket containing `at`
    pub fn truncate(&self, at: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
        let wall = self.local(at);
        let grid = self.floor(wall, granularity);

        if let LocalResult::Single(start) = self.tz.from_local_datetime(&grid) {
            let settled = at
                .checked_sub_signed(settle_window())
                .is_some_and(|earlier| self.offset_at(earlier) == self.offset_at(at));
            if settled {
                return start.with_timezone(&Utc);
            }
        }

        let from = wall.checked_sub_signed(settle_window()).unwrap_or(wall);
        let to = wall.checked_add_signed(settle_window()).unwrap_or(wall);
        self.starts_between(from, to, granularity)
            .into_iter()
            .filter(|start| *start <= at)
            .max()
            .unwrap_or_else(|| self.resolve(grid))
    }

    /// Start of the bucket immediately after the one containing `at`
    pub fn next(&self, at: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
        let start = self.truncate(at, granularity);
        let wall = self.local(start);
        let grid = self.floor(wall, granularity);
        let Some(following) = self.grid_after(grid, granularity) else {
            return start;
        };
        let candidate = self.resolve(following);

        let single = matches!(self.tz.from_local_datetime(&grid), LocalResult::Single(_));
        if single && candidate > start && self.offset_at(candidate) == self.offset_at(start) {
            return candidate;
        }

        let from = wall.checked_sub_signed(settle_window()).unwrap_or(wall);
        self.starts_between(from, following, granularity)
            .into_iter()
            .filter(|s| *s > start)
            .min()
            .unwrap_or(candidate)
    }

    /// Ordered bucket starts from the bucket of `from` up to the bucket of `to`
    ///
    /// Inclusive on both ends. When `from` is after `to` the result is the
    /// single bucket containing `from`.
    pub fn timeline(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        granularity: Granularity,
    ) -> Vec<DateTime<Utc>> {
        let end = self.truncate(to, granularity);
        let mut current = self.truncate(from, granularity);
        let mut timeline = vec![current];

        loop {
            let next = self.next(current, granularity);
            // `next <= current` only happens at the edge of the representable range
            if next > end || next <= current {
                break;
            }
            timeline.push(next);
            current = next;
        }

        timeline
    }

    /// Timeline between two textual timestamps
    ///
    /// Returns an empty list when `from` cannot be parsed. An unparseable
    /// `to` collapses the range onto `from`.
    pub fn timeline_str(&self, from: &str, to: &str, granularity: Granularity) -> Vec<DateTime<Utc>> {
        let Some(from) = parse_timestamp(from) else {
            return Vec::new();
        };
        let to = parse_timestamp(to).unwrap_or(from);
        self.timeline(from, to, granularity)
    }

    /// Build the canonical key for `name` in the bucket containing `at`
    pub fn bucket_key(&self, name: &str, at: DateTime<Utc>, granularity: Granularity) -> BucketKey {
        BucketKey::new_unchecked(None, name, granularity, self.truncate(at, granularity))
    }

    fn local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.with_timezone(&self.tz).naive_local()
    }

    fn offset_at(&self, at: DateTime<Utc>) -> FixedOffset {
        at.with_timezone(&self.tz).offset().fix()
    }

    /// Grid point following `grid`
    fn grid_after(
        &self,
        grid: NaiveDateTime,
        granularity: Granularity,
    ) -> Option<NaiveDateTime> {
        grid.checked_add_signed(TimeDelta::seconds(granularity.step_seconds()))
            .map(|jumped| self.floor(jumped, granularity))
    }

    /// Every bucket start whose grid point lies in `from..=to`, plus the one after
    fn starts_between(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
        granularity: Granularity,
    ) -> Vec<DateTime<Utc>> {
        let mut starts = Vec::new();
        let mut grid = self.floor(from, granularity);
        loop {
            starts.push(self.resolve(grid));
            starts.extend(self.repeated_start(grid, granularity));
            if grid > to {
                break;
            }
            match self.grid_after(grid, granularity) {
                Some(after) if after > grid => grid = after,
                _ => break,
            }
        }
        starts
    }

    /// Second start of a grid point the wall clock passes twice
    ///
    /// Only when the bucket opened at the earlier instant runs its full
    /// wall-clock length before the offset changes; otherwise the repeat is
    /// still inside that bucket.
    fn repeated_start(
        &self,
        grid: NaiveDateTime,
        granularity: Granularity,
    ) -> Option<DateTime<Utc>> {
        let LocalResult::Ambiguous(early, late) = self.tz.from_local_datetime(&grid) else {
            return None;
        };
        let end = self.grid_after(grid, granularity)?;
        let span = end.signed_duration_since(grid) - TimeDelta::seconds(1);
        let last = early.with_timezone(&Utc).checked_add_signed(span)?;
        (self.offset_at(last) == early.offset().fix()).then(|| late.with_timezone(&Utc))
    }

    /// Zero out fields finer than `granularity` on a wall-clock time
    fn floor(&self, local: NaiveDateTime, granularity: Granularity) -> NaiveDateTime {
        let date = local.date();
        match granularity {
            Granularity::Minute => date.and_time(hm(local.hour(), local.minute())),
            Granularity::Hour => date.and_time(hm(local.hour(), 0)),
            Granularity::Day => midnight(date),
            Granularity::Week => {
                let days_back = (local.weekday().num_days_from_monday() + 7
                    - self.week_start.num_days_from_monday())
                    % 7;
                midnight(date.checked_sub_days(Days::new(days_back.into())).unwrap_or(date))
            },
            Granularity::Month => midnight(first_of_month(date, date.month())),
            Granularity::Quarter => {
                let month = date.month();
                midnight(first_of_month(date, month - ((month + 2) % 3)))
            },
            Granularity::Year => midnight(first_of_month(date, 1)),
        }
    }

    /// Map a wall-clock time back to its first instant
    ///
    /// Ambiguous times (DST fall-back) take the earlier instant; the later one
    /// comes from [`Self::repeated_start`]. Times inside a DST gap move forward
    /// to the first minute that exists.
    fn resolve(&self, local: NaiveDateTime) -> DateTime<Utc> {
        if let Some(at) = self.tz.from_local_datetime(&local).earliest() {
            return at.with_timezone(&Utc);
        }

        let mut probe = local;
        for _ in 0..MAX_GAP_MINUTES {
            probe = match probe.checked_add_signed(TimeDelta::minutes(1)) {
                Some(p) => p,
                None => break,
            };
            if let Some(at) = self.tz.from_local_datetime(&probe).earliest() {
                return at.with_timezone(&Utc);
            }
        }

        Utc.from_utc_datetime(&local)
    }
}

/// Parse an RFC 3339 timestamp or integer epoch seconds
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn settle_window() -> TimeDelta {
    TimeDelta::seconds(SETTLE_SECONDS)
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

fn first_of_month(date: NaiveDate, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
}
