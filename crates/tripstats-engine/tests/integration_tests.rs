//! Integration tests for the aggregation pipeline over SQLite databases.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tempfile::tempdir;
use tripstats_core::{DateType, GeoType, ScopeType};
use tripstats_engine::{
    Campaign, CampaignEntry, Country, DailyStat, Dataset, EngineError, LegDetail,
    LegDetailResolver, LegResolution, Pipeline, PipelineSettings, SourceDatabase, Sources,
    StatTotals, StatsDatabase, TripRecord, UserRecord,
};

/// 03:00 on the morning of the nightly run; the newest day key is Sep 15.
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 15, 3, 0, 0).unwrap()
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, d, 0, 0, 0).unwrap()
}

fn at(d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, d, h, 0, 0).unwrap()
}

fn user(id: &str, city: &str) -> UserRecord {
    UserRecord {
        user_id: id.into(),
        city: Some(city.into()),
    }
}

/// Two Portuguese cities, one campaign spanning both.
fn dataset() -> Dataset {
    Dataset {
        users: vec![user("u1", "Lisbon"), user("u2", "Lisbon"), user("u3", "Porto")],
        trips: vec![
            TripRecord::new("t1", "u1", at(14, 8)),
            // resubmission of t1
            TripRecord::new("t1-dup", "u1", at(14, 8)),
            TripRecord::new("t2", "u2", at(14, 9)),
            TripRecord::new("t3", "u3", at(14, 10)),
            TripRecord::new("t4", "u1", at(10, 10)),
        ],
        legs: vec![
            LegDetail::new("t1", at(14, 8), at(14, 8) + Duration::seconds(60), 600.0, 1)
                .with_wasted_time(3.0)
                .with_values(&[2.0, 1.0])
                .with_overall_score(4.0),
            LegDetail::new("t1-dup", at(14, 8), at(14, 9), 9999.0, 1),
            LegDetail::new("t2", at(14, 9), at(14, 9) + Duration::seconds(40), 3.0, 2)
                .with_wasted_time(3.0),
            LegDetail::new("t3", at(14, 10), at(14, 10) + Duration::seconds(120), 1000.0, 3),
            LegDetail::new("t4", at(10, 10), at(10, 10) + Duration::seconds(300), 2000.0, 1),
        ],
        campaigns: vec![CampaignEntry {
            campaign: Campaign {
                id: "c1".into(),
                name: "Cross-city commute".into(),
                member_user_ids: vec!["u1".into(), "u3".into()],
            },
            active: true,
        }],
        countries: vec![Country {
            name: "Portugal".into(),
            cities: vec!["Lisbon".into(), "Porto".into()],
        }],
    }
}

fn setup() -> (Arc<SourceDatabase>, Arc<StatsDatabase>, Pipeline) {
    let source = Arc::new(SourceDatabase::open_in_memory().unwrap());
    source.import(&dataset()).unwrap();
    let stats = Arc::new(StatsDatabase::open_in_memory().unwrap());
    let pipeline = Pipeline::new(
        Sources::single(source.clone()),
        stats.clone(),
        stats.clone(),
        PipelineSettings::default(),
    );
    (source, stats, pipeline)
}

/// How [`PoisonedResolver`] misbehaves for the poisoned trip.
#[derive(Clone, Copy)]
enum Fault {
    /// The call succeeds but answers with an error payload
    Payload,
    /// The call itself fails
    CallError,
}

/// Resolver that misbehaves whenever `poison` is requested.
struct PoisonedResolver {
    inner: Arc<SourceDatabase>,
    poison: &'static str,
    fault: Fault,
}

#[async_trait]
impl LegDetailResolver for PoisonedResolver {
    async fn resolve(&self, trip_ids: &[String]) -> tripstats_engine::Result<LegResolution> {
        if trip_ids.iter().any(|id| id == self.poison) {
            return match self.fault {
                Fault::Payload => Ok(LegResolution::Failed("upstream timeout".into())),
                Fault::CallError => Err(EngineError::Repository("connection reset".into())),
            };
        }
        self.inner.resolve(trip_ids).await
    }
}

fn faulty_pipeline(poison: &'static str, fault: Fault) -> (Arc<StatsDatabase>, Pipeline) {
    let source = Arc::new(SourceDatabase::open_in_memory().unwrap());
    source.import(&dataset()).unwrap();
    let stats = Arc::new(StatsDatabase::open_in_memory().unwrap());
    let sources = Sources::single(source.clone()).with_resolver(Arc::new(PoisonedResolver {
        inner: source,
        poison,
        fault,
    }));
    let pipeline = Pipeline::new(sources, stats.clone(), stats.clone(), PipelineSettings::default());
    (stats, pipeline)
}

fn poisoned_pipeline(poison: &'static str) -> (Arc<StatsDatabase>, Pipeline) {
    faulty_pipeline(poison, Fault::Payload)
}

fn daily(stats: &StatsDatabase, scope_type: ScopeType, id: &str, date: DateTime<Utc>) -> DailyStat {
    stats
        .get_daily_at(scope_type, id, date)
        .unwrap()
        .unwrap_or_else(|| panic!("missing daily row for {id}"))
}

fn interval(stats: &StatsDatabase, geo_type: GeoType, name: &str, date_type: DateType) -> StatTotals {
    stats
        .get_intervals(geo_type, name)
        .unwrap()
        .into_iter()
        .find(|s| s.date_type == date_type)
        .map(|s| s.stats)
        .unwrap_or_else(|| panic!("missing {date_type} summary for {name}"))
}

#[tokio::test]
async fn test_nightly_pipeline_end_to_end() {
    let (_, stats, pipeline) = setup();

    let report = pipeline.run_nightly(now(), 0).await.unwrap();
    assert_eq!(report.scopes_processed, 3);
    assert_eq!(report.scopes_skipped, 0);
    // two cities, one country, one campaign
    assert_eq!(report.summaries_written, 24);

    let lisbon = daily(&stats, ScopeType::City, "Lisbon", day(15)).stats;
    assert_eq!(lisbon.total_legs, 1);
    assert_eq!(lisbon.total_distance, 600.0);
    assert_eq!(lisbon.total_duration, 60.0);
    assert_eq!(lisbon.total_users, 2);
    // the 3m leg is filtered but its wasted time still counts
    assert_eq!(lisbon.wasted_time_total, 6.0);
    assert_eq!(lisbon.wasted_time_total_count, 2);
    assert_eq!(lisbon.value_from_trip_total[4], 2.0);
    assert_eq!(lisbon.corrected_modes.len(), 1);
    assert_eq!(lisbon.corrected_modes[0].mode, 1);

    let campaign = daily(&stats, ScopeType::Campaign, "c1", day(15)).stats;
    assert_eq!(campaign.total_legs, 2);
    assert_eq!(campaign.total_distance, 1600.0);

    let portugal = interval(&stats, GeoType::Country, "Portugal", DateType::Day1);
    assert_eq!(portugal.total_legs, 2);
    assert_eq!(portugal.total_distance, 1600.0);

    let campaign_day1 = interval(&stats, GeoType::Campaign, "c1", DateType::Day1);
    assert_eq!(campaign_day1, campaign);
}

#[tokio::test]
async fn test_rerun_is_byte_identical() {
    let (_, stats, pipeline) = setup();

    pipeline.run_nightly(now(), 0).await.unwrap();
    let first = stats
        .daily_document(ScopeType::City, "Lisbon", day(15))
        .unwrap()
        .unwrap();
    let rows = stats.count_daily().unwrap();

    pipeline.run_nightly(now(), 0).await.unwrap();
    let second = stats
        .daily_document(ScopeType::City, "Lisbon", day(15))
        .unwrap()
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(stats.count_daily().unwrap(), rows);
}

#[tokio::test]
async fn test_populate_then_intervals() {
    let (_, stats, pipeline) = setup();

    let report = pipeline.populate(now(), 7).await.unwrap();
    assert_eq!(report.days_recomputed, 7);
    assert_eq!(stats.count_daily().unwrap(), 21);

    // t4 started Sep 10 10:00, inside the day keyed Sep 11
    assert_eq!(daily(&stats, ScopeType::City, "Lisbon", day(11)).stats.total_legs, 1);
    assert_eq!(daily(&stats, ScopeType::City, "Lisbon", day(12)).stats.total_legs, 0);

    pipeline.refresh_intervals(now(), 0).await.unwrap();
    assert_eq!(interval(&stats, GeoType::City, "Lisbon", DateType::Day3).total_legs, 1);
    assert_eq!(interval(&stats, GeoType::City, "Lisbon", DateType::Day7).total_legs, 2);
    assert_eq!(
        interval(&stats, GeoType::City, "Lisbon", DateType::Day7).total_distance,
        2600.0
    );
}

#[tokio::test]
async fn test_ever_includes_rows_older_than_a_year() {
    let (_, stats, pipeline) = setup();
    pipeline.run_nightly(now(), 0).await.unwrap();

    stats
        .put_daily(&DailyStat {
            scope_type: ScopeType::City,
            scope_id: "Porto".into(),
            date: day(15) - Duration::days(800),
            stats: StatTotals {
                total_legs: 40,
                ..Default::default()
            },
        })
        .unwrap();
    pipeline.refresh_intervals(now(), 0).await.unwrap();

    assert_eq!(interval(&stats, GeoType::City, "Porto", DateType::Day365).total_legs, 1);
    assert_eq!(interval(&stats, GeoType::City, "Porto", DateType::Ever).total_legs, 41);
    assert_eq!(interval(&stats, GeoType::Country, "Portugal", DateType::Ever).total_legs, 42);
}

#[tokio::test]
async fn test_country_is_sum_of_cities() {
    let (_, stats, pipeline) = setup();
    pipeline.populate(now(), 7).await.unwrap();
    pipeline.refresh_intervals(now(), 0).await.unwrap();

    for date_type in DateType::ALL {
        let lisbon = interval(&stats, GeoType::City, "Lisbon", date_type);
        let porto = interval(&stats, GeoType::City, "Porto", date_type);
        let portugal = interval(&stats, GeoType::Country, "Portugal", date_type);
        assert_eq!(portugal, StatTotals::sum([&lisbon, &porto]), "{date_type}");
    }
}

#[tokio::test]
async fn test_resolver_failure_skips_scope_in_nightly() {
    let (stats, pipeline) = poisoned_pipeline("t3");

    let report = pipeline.run_nightly(now(), 0).await.unwrap();
    assert_eq!(report.scopes_processed, 1);
    assert_eq!(report.scopes_skipped, 2);

    assert!(stats.get_daily_at(ScopeType::City, "Lisbon", day(15)).unwrap().is_some());
    assert!(stats.get_daily_at(ScopeType::City, "Porto", day(15)).unwrap().is_none());
    assert!(stats.get_daily_at(ScopeType::Campaign, "c1", day(15)).unwrap().is_none());
}

#[tokio::test]
async fn test_resolver_call_error_skips_scope_in_nightly() {
    let (stats, pipeline) = faulty_pipeline("t3", Fault::CallError);

    let report = pipeline.run_nightly(now(), 0).await.unwrap();
    assert_eq!(report.scopes_processed, 1);
    assert_eq!(report.scopes_skipped, 2);

    assert!(stats.get_daily_at(ScopeType::City, "Lisbon", day(15)).unwrap().is_some());
    assert!(stats.get_daily_at(ScopeType::City, "Porto", day(15)).unwrap().is_none());

    // the interval and country refresh still ran
    assert_eq!(interval(&stats, GeoType::City, "Lisbon", DateType::Day1).total_legs, 1);
    assert_eq!(stats.get_intervals(GeoType::Country, "Portugal").unwrap().len(), 6);
}

#[tokio::test]
async fn test_resolver_call_error_skips_user() {
    let (stats, pipeline) = faulty_pipeline("t3", Fault::CallError);

    let report = pipeline.run_user_stats(now()).await.unwrap();
    assert_eq!(report.scopes_processed, 2);
    assert_eq!(report.scopes_skipped, 1);
    assert!(stats.get_user("u3").unwrap().is_empty());
    assert_eq!(stats.get_user("u1").unwrap().len(), 6);
}

#[tokio::test]
async fn test_resolver_failure_halts_dirty_batch() {
    let (stats, pipeline) = poisoned_pipeline("t3");
    stats.mark_dirty(day(15)).unwrap();
    stats.mark_dirty(day(11)).unwrap();

    let err = pipeline.run_dirty_days(10).await.unwrap_err();
    assert!(err.is_resolver_error());

    // Sep 11 was recomputed before the failing day and stays corrected
    assert_eq!(daily(&stats, ScopeType::City, "Lisbon", day(11)).stats.total_legs, 1);
    let pending = stats.pending_dirty(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].date, day(15));
}

#[tokio::test]
async fn test_late_trip_recomputed_through_dirty_days() {
    let (source, stats, pipeline) = setup();
    pipeline.run_nightly(now(), 0).await.unwrap();

    let late = vec![TripRecord::new("t5", "u2", at(14, 12))];
    source.insert_trips(&late).unwrap();
    source
        .insert_legs(&[LegDetail::new("t5", at(14, 12), at(14, 12) + Duration::seconds(100), 800.0, 1)])
        .unwrap();
    assert_eq!(pipeline.mark_dirty_for_trips(&late, now()).await.unwrap(), 1);

    let report = pipeline.run_dirty_days(10).await.unwrap();
    assert_eq!(report.days_recomputed, 1);
    assert!(stats.pending_dirty(10).unwrap().is_empty());

    let lisbon = daily(&stats, ScopeType::City, "Lisbon", day(15)).stats;
    assert_eq!(lisbon.total_legs, 2);
    assert_eq!(lisbon.total_distance, 1400.0);
}

#[tokio::test]
async fn test_user_stats_pipeline() {
    let (_, stats, pipeline) = setup();

    let report = pipeline.run_user_stats(now()).await.unwrap();
    assert_eq!(report.scopes_processed, 3);
    assert_eq!(report.summaries_written, 18);

    let u1 = stats.get_user("u1").unwrap();
    assert_eq!(u1.len(), 6);
    let day1 = &u1[0];
    assert_eq!(day1.date_type, DateType::Day1);
    assert_eq!(day1.stats.total_legs, 1);
    // the duplicate submission never counts
    let ever = u1.iter().find(|s| s.date_type == DateType::Ever).unwrap();
    assert_eq!(ever.stats.total_legs, 2);
    assert_eq!(ever.stats.total_distance, 2600.0);
}

#[tokio::test]
async fn test_user_stats_skip_failed_resolution() {
    let (stats, pipeline) = poisoned_pipeline("t3");

    let report = pipeline.run_user_stats(now()).await.unwrap();
    assert_eq!(report.scopes_processed, 2);
    assert_eq!(report.scopes_skipped, 1);
    assert!(stats.get_user("u3").unwrap().is_empty());
}

#[tokio::test]
async fn test_file_backed_databases_persist() {
    let dir = tempdir().unwrap();
    let dataset_path = dir.path().join("dataset.json");
    std::fs::write(&dataset_path, serde_json::to_string(&dataset()).unwrap()).unwrap();

    {
        let source = Arc::new(SourceDatabase::open(dir.path().join("source.db")).unwrap());
        source.import(&Dataset::from_file(&dataset_path).unwrap()).unwrap();
        let stats = Arc::new(StatsDatabase::open(dir.path().join("stats.db")).unwrap());
        let pipeline = Pipeline::new(
            Sources::single(source),
            stats.clone(),
            stats,
            PipelineSettings::default(),
        );
        pipeline.run_nightly(now(), 0).await.unwrap();
    }

    let stats = StatsDatabase::open(dir.path().join("stats.db")).unwrap();
    assert_eq!(stats.get_daily(ScopeType::City, "Lisbon").unwrap().len(), 1);
    assert_eq!(stats.get_intervals(GeoType::Country, "Portugal").unwrap().len(), 6);
}
