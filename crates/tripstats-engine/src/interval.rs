//! Accumulation of daily rows (or a user's legs) over the six lookback windows.
//!
//! Each window is computed from scratch by scanning the full input, never
//! chained from a shorter window, so rerunning always converges on the same
//! summaries.

use crate::daily::{LegAccumulator, LegThresholds, trip_owners};
use crate::models::{DailyStat, IntervalSummary, LegDetail, StatTotals, TripRecord};
use crate::window::{in_interval, interval_bounds};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tripstats_core::{DateType, GeoType};

/// Sum the daily rows whose date falls in the window for `date_type`.
pub fn accumulate_daily(
    rows: &[DailyStat],
    date_type: DateType,
    anchor: DateTime<Utc>,
    offset_days: u32,
) -> StatTotals {
    let bounds = interval_bounds(anchor, date_type, offset_days);
    let selected = rows.iter().filter(|row| match bounds {
        None => true,
        Some((start, end)) => start <= row.date && row.date < end,
    });
    StatTotals::sum(selected.map(|row| &row.stats))
}

/// The six summaries of one scope.
pub fn summarize_daily(
    geo_type: GeoType,
    name: &str,
    rows: &[DailyStat],
    anchor: DateTime<Utc>,
    offset_days: u32,
) -> Vec<IntervalSummary> {
    DateType::ALL
        .iter()
        .map(|&date_type| IntervalSummary {
            geo_type,
            name: name.to_string(),
            date_type,
            stats: accumulate_daily(rows, date_type, anchor, offset_days),
        })
        .collect()
}

/// Per-user variant: accumulate legs directly.
///
/// A leg counts when its trip started in the window and the leg itself also
/// started in the window. `trips` must already be deduplicated; legs of any
/// other trip are ignored.
pub fn accumulate_user_legs(
    trips: &[TripRecord],
    legs: &[LegDetail],
    date_type: DateType,
    anchor: DateTime<Utc>,
    offset_days: u32,
    thresholds: LegThresholds,
) -> StatTotals {
    let owners = trip_owners(trips);
    let trip_starts: HashMap<&str, Option<DateTime<Utc>>> = trips
        .iter()
        .map(|trip| (trip.trip_id.as_str(), trip.start_date))
        .collect();

    let mut accumulator = LegAccumulator::new(thresholds);
    for leg in legs {
        let Some(user_id) = owners.get(leg.trip_id.as_str()) else {
            continue;
        };
        let trip_start = trip_starts.get(leg.trip_id.as_str()).copied().flatten();
        if in_interval(trip_start, anchor, date_type, offset_days)
            && in_interval(leg.start_date, anchor, date_type, offset_days)
        {
            accumulator.add_leg(user_id, leg);
        }
    }
    accumulator.finish()
}
