//! Daily aggregation of legs into one [`DailyStat`] per scope.
//!
//! ## Acceptance rules
//!
//! - A leg counts only if its trip survives deduplication.
//! - `overallScore` counts when it lies in `[1, 5]`.
//! - Distance, duration, leg count and the per-mode bucket require
//!   `distance > min_distance` and `duration > min_duration`.
//! - Scope-wide wasted time (`[1, 5]`) and value-from-trip (`[0, 2]`) totals
//!   take every resolved leg, including legs that fail the distance and
//!   duration filter. Per-mode versions only take accepted legs.
//! - Slot 4 of value-from-trip is `max(value[0], value[1])` and is only
//!   derived when both inputs are in range.

use crate::dedup::dedup_in_place;
use crate::error::Result;
use crate::models::{
    DERIVED_VALUE_INDEX, DailyStat, LegDetail, ModeBucket, REPORTED_VALUES, Scope, StatTotals,
    TripRecord, VALUE_SLOTS,
};
use crate::sources::{LegDetailResolver, TripRepository};
use crate::store::StatisticsStore;
use crate::window::DayWindow;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};
use tripstats_config::AggregationConfig;
use tripstats_core::{ScopeType, log_scope_event};

const SCORE_RANGE: (f64, f64) = (1.0, 5.0);
const VALUE_RANGE: (f64, f64) = (0.0, 2.0);

fn in_range(value: f64, (low, high): (f64, f64)) -> bool {
    value.is_finite() && value >= low && value <= high
}

/// Minimum distance and duration a leg must exceed to count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegThresholds {
    /// Meters
    pub min_distance: f64,
    /// Seconds
    pub min_duration_secs: f64,
}

impl Default for LegThresholds {
    fn default() -> Self {
        Self {
            min_distance: 5.0,
            min_duration_secs: 5.0,
        }
    }
}

impl From<&AggregationConfig> for LegThresholds {
    fn from(config: &AggregationConfig) -> Self {
        Self {
            min_distance: config.min_leg_distance,
            min_duration_secs: config.min_leg_duration_secs,
        }
    }
}

impl LegThresholds {
    /// Duration of the leg if it passes both filters.
    fn accepts(&self, leg: &LegDetail) -> Option<f64> {
        let distance = leg.distance.filter(|d| d.is_finite())?;
        let duration = leg.duration_secs()?;
        (distance > self.min_distance && duration > self.min_duration_secs).then_some(duration)
    }
}

/// Running totals over a stream of legs.
#[derive(Debug, Default)]
pub struct LegAccumulator {
    thresholds: LegThresholds,
    totals: StatTotals,
    modes: BTreeMap<i32, ModeBucket>,
    users: HashSet<String>,
}

impl LegAccumulator {
    pub fn new(thresholds: LegThresholds) -> Self {
        Self {
            thresholds,
            ..Default::default()
        }
    }

    /// Add one leg owned by `user_id`.
    pub fn add_leg(&mut self, user_id: &str, leg: &LegDetail) {
        if !self.users.contains(user_id) {
            self.users.insert(user_id.to_string());
        }

        if let Some(score) = leg.overall_score.filter(|s| in_range(*s, SCORE_RANGE)) {
            self.totals.overall_score_total += score;
            self.totals.overall_score_count += 1;
        }

        let wasted_time = leg.wasted_time.filter(|w| in_range(*w, SCORE_RANGE));
        let values = leg_values(leg);

        if let Some(wasted) = wasted_time {
            self.totals.wasted_time_total += wasted;
            self.totals.wasted_time_total_count += 1;
        }
        for (index, value) in values.iter().enumerate() {
            if let Some(value) = value {
                self.totals.value_from_trip_total[index] += value;
                self.totals.value_from_trip_total_count[index] += 1;
            }
        }

        let Some(duration) = self.thresholds.accepts(leg) else {
            debug!(trip_id = %leg.trip_id, "leg below distance/duration threshold");
            return;
        };
        let distance = leg.distance.unwrap_or_default();

        self.totals.total_distance += distance;
        self.totals.total_duration += duration;
        self.totals.total_legs += 1;

        let mode = leg.mode();
        let bucket = self
            .modes
            .entry(mode)
            .or_insert_with(|| ModeBucket::new(mode));
        bucket.count += 1;
        bucket.distance += distance;
        bucket.duration += duration;
        bucket.weighted_sum += duration;

        if let Some(wasted) = wasted_time {
            bucket.wasted_time_mode += wasted;
            bucket.wasted_time_mode_count += 1;
            bucket.wasted_time_w_sum += wasted * duration;
        }
        for (index, value) in values.iter().enumerate() {
            if let Some(value) = value {
                bucket.value_from_trip_mode[index] += value;
                bucket.value_from_trip_mode_count[index] += 1;
                bucket.value_from_trip_mode_w_sum[index] += value * duration;
            }
        }
    }

    /// Distinct users seen so far.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Final totals, without the unknown-mode bucket.
    pub fn finish(self) -> StatTotals {
        let mut totals = self.totals;
        totals.total_users = self.users.len() as u64;
        totals.corrected_modes = self.modes.into_values().collect();
        totals.drop_unknown_modes();
        totals
    }
}

/// The five value slots of a leg: four reported, one derived.
fn leg_values(leg: &LegDetail) -> [Option<f64>; VALUE_SLOTS] {
    let mut values = [None; VALUE_SLOTS];
    for (index, slot) in values.iter_mut().take(REPORTED_VALUES).enumerate() {
        *slot = leg.value(index).filter(|v| in_range(*v, VALUE_RANGE));
    }
    if let (Some(first), Some(second)) = (values[0], values[1]) {
        values[DERIVED_VALUE_INDEX] = Some(first.max(second).clamp(VALUE_RANGE.0, VALUE_RANGE.1));
    }
    values
}

/// Map each trip id to the user that owns it.
pub fn trip_owners(trips: &[TripRecord]) -> HashMap<&str, &str> {
    trips
        .iter()
        .filter_map(|trip| Some((trip.trip_id.as_str(), trip.user_id.as_deref()?)))
        .collect()
}

/// Build one daily row from already-deduplicated trips and their legs.
///
/// Legs whose trip is not in `trips` are ignored.
pub fn compute_daily_stat(
    scope_type: ScopeType,
    scope_id: &str,
    date: DateTime<Utc>,
    trips: &[TripRecord],
    legs: &[LegDetail],
    thresholds: LegThresholds,
) -> DailyStat {
    let owners = trip_owners(trips);
    let mut accumulator = LegAccumulator::new(thresholds);

    for leg in legs {
        match owners.get(leg.trip_id.as_str()) {
            Some(user_id) => accumulator.add_leg(user_id, leg),
            None => debug!(trip_id = %leg.trip_id, "leg without a live trip, skipped"),
        }
    }

    DailyStat {
        scope_type,
        scope_id: scope_id.to_string(),
        date,
        stats: accumulator.finish(),
    }
}

/// Runs the daily aggregation for one scope against the collaborators.
pub struct DailyAggregator<'a> {
    trips: &'a dyn TripRepository,
    resolver: &'a dyn LegDetailResolver,
    store: &'a dyn StatisticsStore,
    thresholds: LegThresholds,
}

impl<'a> DailyAggregator<'a> {
    pub fn new(
        trips: &'a dyn TripRepository,
        resolver: &'a dyn LegDetailResolver,
        store: &'a dyn StatisticsStore,
        thresholds: LegThresholds,
    ) -> Self {
        Self {
            trips,
            resolver,
            store,
            thresholds,
        }
    }

    /// Aggregate the day ending at `reference` for `scope` and upsert it.
    pub async fn aggregate(&self, scope: &Scope, reference: DateTime<Utc>) -> Result<DailyStat> {
        let window = DayWindow::ending_at(reference);
        let label = scope.label();

        let mut trips = self
            .trips
            .find_by_user_and_window(&scope.member_user_ids, window.start, window.end)
            .await?;
        let duplicates = dedup_in_place(&mut trips);

        let legs = if trips.is_empty() {
            Vec::new()
        } else {
            let trip_ids: Vec<String> = trips.iter().map(|t| t.trip_id.clone()).collect();
            self.resolver
                .resolve(&trip_ids)
                .await
                .map_err(|e| e.into_resolver(&label))?
                .into_result(&label)?
        };

        let stat = compute_daily_stat(
            scope.scope_type,
            &scope.scope_id,
            window.date,
            &trips,
            &legs,
            self.thresholds,
        );
        self.store.upsert_daily(&stat).await?;

        info!(
            scope = %label,
            date = %window.date.format("%Y-%m-%d"),
            trips = trips.len(),
            duplicates,
            legs = stat.stats.total_legs,
            users = stat.stats.total_users,
            "daily stat written"
        );
        log_scope_event!(scope.scope_type, scope.scope_id, "daily");

        Ok(stat)
    }
}
