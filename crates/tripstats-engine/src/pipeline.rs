//! Orchestration of the aggregation passes.
//!
//! Entry points:
//! - [`Pipeline::run_nightly`]: daily rows for every city then every campaign,
//!   followed by the interval and country refresh.
//! - [`Pipeline::populate`]: daily rows for offsets `0..days`, one after another.
//! - [`Pipeline::run_dirty_days`]: recompute the oldest queued days.
//! - [`Pipeline::run_user_stats`]: per-user summaries.
//!
//! Every unit is awaited before the next one starts, so no two writes ever
//! target the same document concurrently.

use crate::daily::{DailyAggregator, LegThresholds};
use crate::error::Result;
use crate::interval::summarize_daily;
use crate::models::{RunReport, Scope, TripRecord};
use crate::rollup::rollup_country;
use crate::sources::Sources;
use crate::store::{DirtyDayStore, StatisticsStore};
use crate::users::UserStatsBuilder;
use crate::window::{DayWindow, interval_anchor, reference_for_date, reference_instant, stat_date_for};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tripstats_config::AggregationConfig;
use tripstats_core::{GeoType, ScopeType, log_scope_event};

/// What to do when one scope fails inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Resolver failures skip the scope; other errors still abort.
    SkipScope,
    /// Any failure aborts the batch.
    HaltBatch,
}

/// Tunables of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub cutover_hour: u32,
    pub populate_days: u32,
    pub dirty_day_batch: usize,
    pub thresholds: LegThresholds,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&AggregationConfig::default())
    }
}

impl From<&AggregationConfig> for PipelineSettings {
    fn from(config: &AggregationConfig) -> Self {
        Self {
            cutover_hour: config.cutover_hour,
            populate_days: config.populate_days,
            dirty_day_batch: config.dirty_day_batch,
            thresholds: LegThresholds::from(config),
        }
    }
}

/// The aggregation pipeline over one set of collaborators.
pub struct Pipeline {
    sources: Sources,
    store: Arc<dyn StatisticsStore>,
    dirty: Arc<dyn DirtyDayStore>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        sources: Sources,
        store: Arc<dyn StatisticsStore>,
        dirty: Arc<dyn DirtyDayStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            sources,
            store,
            dirty,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Every city scope (in country order) followed by every active campaign.
    pub async fn scopes(&self) -> Result<Vec<Scope>> {
        let mut scopes = Vec::new();
        let mut seen = HashSet::new();

        for country in self.sources.cities.list_countries().await? {
            for city in country.cities {
                if !seen.insert(city.clone()) {
                    continue;
                }
                let members = self.sources.users.users_in_city(&city).await?;
                scopes.push(Scope::city(city, members));
            }
        }

        for campaign in self.sources.campaigns.list_active_campaigns().await? {
            scopes.push(Scope::campaign(&campaign));
        }

        Ok(scopes)
    }

    /// Daily rows of every scope for the day ending at `reference`.
    pub async fn run_daily_scopes(
        &self,
        reference: DateTime<Utc>,
        policy: FailurePolicy,
    ) -> Result<RunReport> {
        let mut report = RunReport::start();
        let aggregator = DailyAggregator::new(
            self.sources.trips.as_ref(),
            self.sources.resolver.as_ref(),
            self.store.as_ref(),
            self.settings.thresholds,
        );

        for scope in self.scopes().await? {
            match aggregator.aggregate(&scope, reference).await {
                Ok(_) => report.scopes_processed += 1,
                Err(e) if e.is_resolver_error() && policy == FailurePolicy::SkipScope => {
                    warn!(scope = %scope.label(), error = %e, "Skipping scope");
                    log_scope_event!(scope.scope_type, scope.scope_id, "skipped");
                    report.scopes_skipped += 1;
                }
                Err(e) => {
                    warn!(scope = %scope.label(), error = %e, "Aborting daily batch");
                    return Err(e);
                }
            }
        }

        Ok(report.finish())
    }

    /// Daily rows for `offset_days`, then the interval and country refresh.
    pub async fn run_nightly(&self, now: DateTime<Utc>, offset_days: u32) -> Result<RunReport> {
        let reference = reference_instant(now, offset_days, self.settings.cutover_hour);
        info!(
            reference = %reference,
            offset_days,
            "Starting nightly aggregation"
        );

        let mut report = self
            .run_daily_scopes(reference, FailurePolicy::SkipScope)
            .await?;
        let intervals = self.refresh_intervals(now, offset_days).await?;
        report.merge(&intervals);

        let report = report.finish();
        info!(
            processed = report.scopes_processed,
            skipped = report.scopes_skipped,
            summaries = report.summaries_written,
            "Nightly aggregation completed"
        );
        Ok(report)
    }

    /// Rebuild every city, country and campaign interval summary.
    pub async fn refresh_intervals(&self, now: DateTime<Utc>, offset_days: u32) -> Result<RunReport> {
        let mut report = RunReport::start();
        let anchor = interval_anchor(now, self.settings.cutover_hour);

        for country in self.sources.cities.list_countries().await? {
            let mut city_summaries = Vec::with_capacity(country.cities.len() * 6);

            for city in &country.cities {
                let rows = self.store.query_daily(ScopeType::City, city).await?;
                let summaries =
                    summarize_daily(ScopeType::City.geo_type(), city, &rows, anchor, offset_days);
                for summary in &summaries {
                    self.store.upsert_interval(summary).await?;
                }
                report.summaries_written += summaries.len();
                debug!(city = %city, rows = rows.len(), "City intervals refreshed");
                city_summaries.extend(summaries);
            }

            for summary in rollup_country(&country.name, &city_summaries) {
                self.store.upsert_interval(&summary).await?;
                report.summaries_written += 1;
            }
            log_scope_event!(GeoType::Country, country.name, "rollup");
        }

        for campaign in self.sources.campaigns.list_active_campaigns().await? {
            let rows = self
                .store
                .query_daily(ScopeType::Campaign, &campaign.id)
                .await?;
            let summaries = summarize_daily(
                ScopeType::Campaign.geo_type(),
                &campaign.id,
                &rows,
                anchor,
                offset_days,
            );
            for summary in summaries {
                self.store.upsert_interval(&summary).await?;
                report.summaries_written += 1;
            }
            log_scope_event!(ScopeType::Campaign, campaign.id, "intervals");
        }

        info!(summaries = report.summaries_written, "Interval summaries refreshed");
        Ok(report.finish())
    }

    /// Backfill daily rows for offsets `0..days`, strictly in sequence.
    pub async fn populate(&self, now: DateTime<Utc>, days: u32) -> Result<RunReport> {
        let mut report = RunReport::start();
        info!(days, "Starting backfill");

        for offset in 0..days {
            let reference = reference_instant(now, offset, self.settings.cutover_hour);
            let day = self
                .run_daily_scopes(reference, FailurePolicy::SkipScope)
                .await?;
            report.merge(&day);
            report.days_recomputed += 1;
            debug!(offset, reference = %reference, "Backfilled day");
        }

        info!(
            days = report.days_recomputed,
            processed = report.scopes_processed,
            skipped = report.scopes_skipped,
            "Backfill completed"
        );
        Ok(report.finish())
    }

    /// Recompute up to `limit` queued days, oldest first.
    ///
    /// The first failing day halts the batch; its marker and every later one
    /// stay queued while already recomputed days keep their fresh rows.
    pub async fn run_dirty_days(&self, limit: usize) -> Result<RunReport> {
        let mut report = RunReport::start();
        let pending = self.dirty.list_pending(limit).await?;
        if pending.is_empty() {
            debug!("No dirty days pending");
            return Ok(report.finish());
        }

        info!(count = pending.len(), "Recomputing dirty days");
        for marker in pending {
            let reference = reference_for_date(marker.date, self.settings.cutover_hour);
            let day = self
                .run_daily_scopes(reference, FailurePolicy::HaltBatch)
                .await?;
            self.dirty.remove(marker.date).await?;
            report.merge(&day);
            report.days_recomputed += 1;
            info!(date = %marker.date.format("%Y-%m-%d"), "Dirty day recomputed");
        }

        Ok(report.finish())
    }

    /// Rebuild the summaries of every known user.
    pub async fn run_user_stats(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let mut report = RunReport::start();
        let builder = UserStatsBuilder::new(
            self.sources.trips.as_ref(),
            self.sources.resolver.as_ref(),
            self.store.as_ref(),
            self.settings.thresholds,
        );

        for user_id in self.sources.users.list_user_ids().await? {
            match builder.build(&user_id, now).await {
                Ok(stats) => {
                    report.scopes_processed += 1;
                    report.summaries_written += stats.len();
                }
                Err(e) if e.is_resolver_error() => {
                    warn!(user_id = %user_id, error = %e, "Skipping user");
                    report.scopes_skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            users = report.scopes_processed,
            skipped = report.scopes_skipped,
            "User stats refreshed"
        );
        Ok(report.finish())
    }

    /// Queue the already aggregated days touched by `trips`.
    ///
    /// Days newer than the latest daily row are left to the nightly run.
    pub async fn mark_dirty_for_trips(&self, trips: &[TripRecord], now: DateTime<Utc>) -> Result<usize> {
        let cutover = self.settings.cutover_hour;
        let latest = DayWindow::ending_at(reference_instant(now, 0, cutover)).date;

        let dates: BTreeSet<DateTime<Utc>> = trips
            .iter()
            .filter_map(|trip| trip.start_date)
            .map(|start| stat_date_for(start, cutover))
            .filter(|date| *date <= latest)
            .collect();

        for date in &dates {
            self.dirty.mark(*date).await?;
        }
        if !dates.is_empty() {
            info!(count = dates.len(), "Marked dirty days");
        }
        Ok(dates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StatsDatabase;
    use crate::models::Country;
    use crate::source_db::{SourceDatabase, UserRecord};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 15, 3, 0, 0).unwrap()
    }

    fn setup() -> (Arc<SourceDatabase>, Arc<StatsDatabase>, Pipeline) {
        let source = Arc::new(SourceDatabase::open_in_memory().unwrap());
        let stats = Arc::new(StatsDatabase::open_in_memory().unwrap());
        let pipeline = Pipeline::new(
            Sources::single(source.clone()),
            stats.clone(),
            stats.clone(),
            PipelineSettings::default(),
        );
        (source, stats, pipeline)
    }

    #[test]
    fn test_settings_from_config() {
        let config = AggregationConfig {
            cutover_hour: 4,
            dirty_day_batch: 3,
            ..Default::default()
        };
        let settings = PipelineSettings::from(&config);
        assert_eq!(settings.cutover_hour, 4);
        assert_eq!(settings.dirty_day_batch, 3);
        assert_eq!(settings.thresholds, LegThresholds::default());
    }

    #[tokio::test]
    async fn test_scopes_cities_then_campaigns() {
        let (source, _, pipeline) = setup();
        source
            .insert_users(&[
                UserRecord { user_id: "u1".into(), city: Some("Lisbon".into()) },
                UserRecord { user_id: "u2".into(), city: Some("Ghent".into()) },
            ])
            .unwrap();
        source
            .insert_country(&Country { name: "Portugal".into(), cities: vec!["Lisbon".into()] })
            .unwrap();
        source
            .insert_country(&Country { name: "Belgium".into(), cities: vec!["Ghent".into()] })
            .unwrap();
        source
            .insert_campaign(
                &crate::models::Campaign {
                    id: "c1".into(),
                    name: "Bike week".into(),
                    member_user_ids: vec!["u1".into(), "u2".into()],
                },
                true,
            )
            .unwrap();

        let scopes = pipeline.scopes().await.unwrap();
        let labels: Vec<String> = scopes.iter().map(Scope::label).collect();
        assert_eq!(labels, vec!["city:Ghent", "city:Lisbon", "campaign:c1"]);
        assert_eq!(scopes[1].member_user_ids, vec!["u1"]);
    }

    #[tokio::test]
    async fn test_mark_dirty_only_past_days() {
        let (_, stats, pipeline) = setup();
        let trips = vec![
            TripRecord::new("a", "u1", now() - Duration::days(3)),
            TripRecord::new("b", "u1", now() - Duration::days(3) + Duration::hours(1)),
            TripRecord::new("c", "u1", now() - Duration::days(1)),
            // belongs to the day ending at the next cutover
            TripRecord::new("d", "u1", now() - Duration::hours(1)),
            TripRecord::new("future", "u1", now() + Duration::days(2)),
        ];

        let marked = pipeline.mark_dirty_for_trips(&trips, now()).await.unwrap();
        assert_eq!(marked, 2);

        let pending = stats.pending_dirty(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].date, Utc.with_ymd_and_hms(2026, 9, 13, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_empty_sources_are_valid() {
        let (_, _, pipeline) = setup();
        let report = pipeline.run_nightly(now(), 0).await.unwrap();
        assert_eq!(report.scopes_processed, 0);
        assert_eq!(report.summaries_written, 0);

        let report = pipeline.run_dirty_days(5).await.unwrap();
        assert_eq!(report.days_recomputed, 0);
    }
}
