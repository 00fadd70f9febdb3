//! Day alignment and lookback windows.
//!
//! A statistics day ends at the cutover instant: the daily window for a
//! reference instant `r` is `[r - 1 day, r)` and its rows are keyed by
//! `day_start(r)`. All windows are half-open.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tripstats_core::DateType;

/// Midnight UTC of the day containing `t`.
pub fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let date = t.date_naive();
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// The most recent cutover instant at or before `now`, moved back `offset_days`.
///
/// `cutover_hour` must be in `0..24`; larger values are clamped.
pub fn reference_instant(now: DateTime<Utc>, offset_days: u32, cutover_hour: u32) -> DateTime<Utc> {
    let cutover = day_start(now) + Duration::hours(i64::from(cutover_hour.min(23)));
    let latest = if now >= cutover {
        cutover
    } else {
        cutover - Duration::days(1)
    };
    latest - Duration::days(i64::from(offset_days))
}

/// The date key of the daily row whose window contains `t`.
pub fn stat_date_for(t: DateTime<Utc>, cutover_hour: u32) -> DateTime<Utc> {
    day_start(reference_instant(t, 0, cutover_hour) + Duration::days(1))
}

/// Reference instant that recomputes the daily row keyed by `date`.
pub fn reference_for_date(date: DateTime<Utc>, cutover_hour: u32) -> DateTime<Utc> {
    day_start(date) + Duration::hours(i64::from(cutover_hour.min(23)))
}

/// Anchor of the daily-row interval windows: the day after the newest daily
/// row key, so that [`DateType::Day1`] holds exactly that row.
pub fn interval_anchor(now: DateTime<Utc>, cutover_hour: u32) -> DateTime<Utc> {
    day_start(reference_instant(now, 0, cutover_hour)) + Duration::days(1)
}

/// The trip window of one daily aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    /// Inclusive
    pub start: DateTime<Utc>,
    /// Exclusive
    pub end: DateTime<Utc>,
    /// Key of the produced daily row
    pub date: DateTime<Utc>,
}

impl DayWindow {
    /// The day that ends at `reference`.
    pub fn ending_at(reference: DateTime<Utc>) -> Self {
        Self {
            start: reference - Duration::days(1),
            end: reference,
            date: day_start(reference),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Bounds of a lookback window: `[anchor - (days + offset), anchor - offset)`.
///
/// Returns `None` for [`DateType::Ever`], which is never filtered.
pub fn interval_bounds(
    anchor: DateTime<Utc>,
    date_type: DateType,
    offset_days: u32,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let days = date_type.days()?;
    let offset = i64::from(offset_days);
    Some((
        anchor - Duration::days(days + offset),
        anchor - Duration::days(offset),
    ))
}

/// Whether `t` falls in the window for `date_type`. Missing timestamps only
/// match the unbounded window.
pub fn in_interval(
    t: Option<DateTime<Utc>>,
    anchor: DateTime<Utc>,
    date_type: DateType,
    offset_days: u32,
) -> bool {
    match interval_bounds(anchor, date_type, offset_days) {
        None => true,
        Some((start, end)) => t.is_some_and(|t| start <= t && t < end),
    }
}

/// Epoch milliseconds, the storage representation of every timestamp.
pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Inverse of [`to_millis`]; out-of-range values clamp to the epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, d, h, m, 0).unwrap()
    }

    #[test]
    fn test_day_start() {
        assert_eq!(day_start(at(10, 13, 45)), at(10, 0, 0));
        assert_eq!(day_start(at(10, 0, 0)), at(10, 0, 0));
    }

    #[test]
    fn test_reference_instant_midnight_cutover() {
        assert_eq!(reference_instant(at(10, 3, 0), 0, 0), at(10, 0, 0));
        assert_eq!(reference_instant(at(10, 3, 0), 2, 0), at(8, 0, 0));
    }

    #[test]
    fn test_reference_instant_before_cutover() {
        // 03:00 is before a 04:00 cutover, so the latest cutover was yesterday
        assert_eq!(reference_instant(at(10, 3, 0), 0, 4), at(9, 4, 0));
        assert_eq!(reference_instant(at(10, 4, 0), 0, 4), at(10, 4, 0));
    }

    #[test]
    fn test_day_window() {
        let window = DayWindow::ending_at(at(10, 4, 0));
        assert_eq!(window.start, at(9, 4, 0));
        assert_eq!(window.end, at(10, 4, 0));
        assert_eq!(window.date, at(10, 0, 0));
        assert!(window.contains(at(9, 4, 0)));
        assert!(!window.contains(at(10, 4, 0)));
    }

    #[test]
    fn test_stat_date_round_trip() {
        let trip_time = at(9, 23, 30);
        let date = stat_date_for(trip_time, 4);
        assert_eq!(date, at(10, 0, 0));
        assert!(DayWindow::ending_at(reference_for_date(date, 4)).contains(trip_time));

        let early = at(9, 2, 0);
        let date = stat_date_for(early, 4);
        assert_eq!(date, at(9, 0, 0));
        assert!(DayWindow::ending_at(reference_for_date(date, 4)).contains(early));
    }

    #[test]
    fn test_interval_bounds() {
        let anchor = at(10, 0, 0);
        assert_eq!(
            interval_bounds(anchor, DateType::Day7, 0),
            Some((at(3, 0, 0), at(10, 0, 0)))
        );
        assert_eq!(
            interval_bounds(anchor, DateType::Day3, 2),
            Some((at(5, 0, 0), at(8, 0, 0)))
        );
        assert_eq!(interval_bounds(anchor, DateType::Ever, 5), None);
    }

    #[test]
    fn test_interval_anchor_covers_newest_row() {
        let now = at(10, 5, 0);
        let newest = DayWindow::ending_at(reference_instant(now, 0, 0)).date;
        let anchor = interval_anchor(now, 0);
        assert_eq!(anchor, at(11, 0, 0));
        assert_eq!(interval_bounds(anchor, DateType::Day1, 0), Some((newest, anchor)));

        // before a 06:00 cutover the newest row is still yesterday's
        assert_eq!(interval_anchor(now, 6), at(10, 0, 0));
    }

    #[test]
    fn test_in_interval_missing_timestamp() {
        let anchor = at(10, 0, 0);
        assert!(!in_interval(None, anchor, DateType::Day1, 0));
        assert!(in_interval(None, anchor, DateType::Ever, 0));
    }

    #[test]
    fn test_millis_round_trip() {
        let t = at(10, 12, 34);
        assert_eq!(from_millis(to_millis(t)), t);
    }
}
