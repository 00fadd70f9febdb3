//! Data models for trips, legs and the statistics documents built from them.
//!
//! Timestamps are `DateTime<Utc>` in memory and epoch milliseconds on every
//! serialized boundary (JSON datasets, stored documents, SQLite columns).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tripstats_core::{DateType, GeoType, ScopeType};

/// Mode value of legs without a recognised transport mode.
pub const UNKNOWN_MODE: i32 = -1;

/// Value-from-trip slots: four reported dimensions plus the derived one.
pub const VALUE_SLOTS: usize = 5;

/// Number of value-from-trip dimensions reported per leg.
pub const REPORTED_VALUES: usize = 4;

/// Index of the derived "either dimension" value.
pub const DERIVED_VALUE_INDEX: usize = 4;

/// A raw trip as stored by the trip repository.
///
/// `user_id` and `start_date` are optional because historical records are
/// not guaranteed to carry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripRecord {
    pub trip_id: String,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub start_date: Option<DateTime<Utc>>,
}

impl TripRecord {
    /// Create a complete trip record.
    pub fn new(trip_id: impl Into<String>, user_id: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            trip_id: trip_id.into(),
            user_id: Some(user_id.into()),
            start_date: Some(start),
        }
    }
}

/// One satisfaction score reported for a leg.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueFromTrip {
    #[serde(default)]
    pub code: Option<i64>,

    #[serde(default)]
    pub value: Option<f64>,
}

impl ValueFromTrip {
    pub fn new(value: f64) -> Self {
        Self {
            code: None,
            value: Some(value),
        }
    }
}

/// Enriched leg returned by the leg detail resolver.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegDetail {
    pub trip_id: String,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub start_date: Option<DateTime<Utc>>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub end_date: Option<DateTime<Utc>>,

    /// Distance in meters
    #[serde(default)]
    pub distance: Option<f64>,

    #[serde(default)]
    pub corrected_mode: Option<i32>,

    /// Self-reported wasted time score (1-5)
    #[serde(default)]
    pub wasted_time: Option<f64>,

    /// Satisfaction scores (0-2), positionally indexed
    #[serde(default)]
    pub value_from_trip: Vec<ValueFromTrip>,

    /// Trip-level score (1-5)
    #[serde(default)]
    pub overall_score: Option<f64>,
}

impl LegDetail {
    /// Create a leg with the fields every accepted leg needs.
    pub fn new(
        trip_id: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        distance: f64,
        mode: i32,
    ) -> Self {
        Self {
            trip_id: trip_id.into(),
            start_date: Some(start),
            end_date: Some(end),
            distance: Some(distance),
            corrected_mode: Some(mode),
            ..Default::default()
        }
    }

    /// Set the wasted time score.
    pub fn with_wasted_time(mut self, wasted_time: f64) -> Self {
        self.wasted_time = Some(wasted_time);
        self
    }

    /// Set the value-from-trip scores.
    pub fn with_values(mut self, values: &[f64]) -> Self {
        self.value_from_trip = values.iter().copied().map(ValueFromTrip::new).collect();
        self
    }

    /// Set the overall score.
    pub fn with_overall_score(mut self, score: f64) -> Self {
        self.overall_score = Some(score);
        self
    }

    /// Leg duration in seconds, when both ends are known.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Mode key used for per-mode buckets.
    pub fn mode(&self) -> i32 {
        self.corrected_mode.unwrap_or(UNKNOWN_MODE)
    }

    /// Value at `index`, if present.
    pub fn value(&self, index: usize) -> Option<f64> {
        self.value_from_trip.get(index).and_then(|v| v.value)
    }
}

/// Per-mode breakdown nested in every statistics document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeBucket {
    pub mode: i32,
    pub count: u64,
    pub distance: f64,
    pub duration: f64,
    pub wasted_time_mode: f64,
    pub wasted_time_mode_count: u64,
    /// Sum of wasted time weighted by leg duration
    pub wasted_time_w_sum: f64,
    pub value_from_trip_mode: [f64; VALUE_SLOTS],
    pub value_from_trip_mode_count: [u64; VALUE_SLOTS],
    /// Sums of values weighted by leg duration
    pub value_from_trip_mode_w_sum: [f64; VALUE_SLOTS],
    /// Total duration of the legs admitted to this bucket
    pub weighted_sum: f64,
}

impl ModeBucket {
    pub fn new(mode: i32) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Add another pre-aggregated bucket of the same mode.
    pub fn absorb(&mut self, other: &ModeBucket) {
        self.count += other.count;
        self.distance += other.distance;
        self.duration += other.duration;
        self.wasted_time_mode += other.wasted_time_mode;
        self.wasted_time_mode_count += other.wasted_time_mode_count;
        self.wasted_time_w_sum += other.wasted_time_w_sum;
        for i in 0..VALUE_SLOTS {
            self.value_from_trip_mode[i] += other.value_from_trip_mode[i];
            self.value_from_trip_mode_count[i] += other.value_from_trip_mode_count[i];
            self.value_from_trip_mode_w_sum[i] += other.value_from_trip_mode_w_sum[i];
        }
        self.weighted_sum += other.weighted_sum;
    }
}

/// The numeric body shared by daily stats, interval summaries and user stats.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatTotals {
    pub value_from_trip_total: [f64; VALUE_SLOTS],
    pub value_from_trip_total_count: [u64; VALUE_SLOTS],
    /// Sorted by mode, never contains [`UNKNOWN_MODE`]
    pub corrected_modes: Vec<ModeBucket>,
    pub wasted_time_total: f64,
    pub wasted_time_total_count: u64,
    pub overall_score_total: f64,
    pub overall_score_count: u64,
    /// Seconds
    pub total_duration: f64,
    /// Meters
    pub total_distance: f64,
    pub total_legs: u64,
    pub total_users: u64,
}

impl StatTotals {
    /// Field-wise sum with per-mode buckets merged by mode key.
    pub fn absorb(&mut self, other: &StatTotals) {
        for i in 0..VALUE_SLOTS {
            self.value_from_trip_total[i] += other.value_from_trip_total[i];
            self.value_from_trip_total_count[i] += other.value_from_trip_total_count[i];
        }
        self.wasted_time_total += other.wasted_time_total;
        self.wasted_time_total_count += other.wasted_time_total_count;
        self.overall_score_total += other.overall_score_total;
        self.overall_score_count += other.overall_score_count;
        self.total_duration += other.total_duration;
        self.total_distance += other.total_distance;
        self.total_legs += other.total_legs;
        self.total_users += other.total_users;

        let mut modes: BTreeMap<i32, ModeBucket> = std::mem::take(&mut self.corrected_modes)
            .into_iter()
            .map(|bucket| (bucket.mode, bucket))
            .collect();
        for bucket in &other.corrected_modes {
            modes
                .entry(bucket.mode)
                .or_insert_with(|| ModeBucket::new(bucket.mode))
                .absorb(bucket);
        }
        self.corrected_modes = modes.into_values().collect();
        self.drop_unknown_modes();
    }

    /// Remove the bucket of legs without a recognised mode.
    pub fn drop_unknown_modes(&mut self) {
        self.corrected_modes.retain(|b| b.mode != UNKNOWN_MODE);
    }

    /// Sum of many totals, in order.
    pub fn sum<'a>(items: impl IntoIterator<Item = &'a StatTotals>) -> StatTotals {
        let mut total = StatTotals::default();
        for item in items {
            total.absorb(item);
        }
        total
    }

    pub fn mode(&self, mode: i32) -> Option<&ModeBucket> {
        self.corrected_modes.iter().find(|b| b.mode == mode)
    }

    pub fn average_overall_score(&self) -> Option<f64> {
        ratio(self.overall_score_total, self.overall_score_count)
    }

    pub fn average_wasted_time(&self) -> Option<f64> {
        ratio(self.wasted_time_total, self.wasted_time_total_count)
    }

    pub fn average_value_from_trip(&self, index: usize) -> Option<f64> {
        if index >= VALUE_SLOTS {
            return None;
        }
        ratio(
            self.value_from_trip_total[index],
            self.value_from_trip_total_count[index],
        )
    }
}

fn ratio(total: f64, count: u64) -> Option<f64> {
    if count == 0 {
        None
    } else {
        Some(total / count as f64)
    }
}

/// An aggregation scope: a city or a campaign and the users it covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub scope_type: ScopeType,
    /// City name or campaign id
    pub scope_id: String,
    /// Display name
    pub name: String,
    pub member_user_ids: Vec<String>,
}

impl Scope {
    pub fn city(name: impl Into<String>, member_user_ids: Vec<String>) -> Self {
        let name = name.into();
        Self {
            scope_type: ScopeType::City,
            scope_id: name.clone(),
            name,
            member_user_ids,
        }
    }

    pub fn campaign(campaign: &Campaign) -> Self {
        Self {
            scope_type: ScopeType::Campaign,
            scope_id: campaign.id.clone(),
            name: campaign.name.clone(),
            member_user_ids: campaign.member_user_ids.clone(),
        }
    }

    /// Label used in logs and errors, e.g. `city:Lisbon`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.scope_type, self.scope_id)
    }
}

/// One day of statistics for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStat {
    pub scope_type: ScopeType,
    pub scope_id: String,
    /// Day-aligned timestamp
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    pub stats: StatTotals,
}

/// Accumulation of daily stats over one of the six windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalSummary {
    pub geo_type: GeoType,
    pub name: String,
    pub date_type: DateType,
    pub stats: StatTotals,
}

/// Per-user statistics over one of the six windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGlobalStat {
    pub user_id: String,
    pub date_type: DateType,
    pub stats: StatTotals,
}

/// A day whose daily stats must be recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyDayMarker {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
}

/// An active campaign and its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub member_user_ids: Vec<String>,
}

/// A country and the cities grouped under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Country {
    pub name: String,
    #[serde(default)]
    pub cities: Vec<String>,
}

/// Outcome of one pipeline entry point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scopes_processed: usize,
    pub scopes_skipped: usize,
    pub summaries_written: usize,
    pub days_recomputed: usize,
}

impl RunReport {
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            scopes_processed: 0,
            scopes_skipped: 0,
            summaries_written: 0,
            days_recomputed: 0,
        }
    }

    /// Fold a sub-run into this report.
    pub fn merge(&mut self, other: &RunReport) {
        self.scopes_processed += other.scopes_processed;
        self.scopes_skipped += other.scopes_skipped;
        self.summaries_written += other.summaries_written;
        self.days_recomputed += other.days_recomputed;
        self.finished_at = self.finished_at.max(other.finished_at);
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}
