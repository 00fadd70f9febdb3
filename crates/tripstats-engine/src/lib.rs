//! # tripstats-engine
//!
//! Statistics aggregation for mobility survey data.
//!
//! This crate provides:
//! - [`DailyAggregator`] - One [`DailyStat`] per scope and day from raw legs
//! - [`interval`] - The six lookback summaries (1, 3, 7, 30, 365 days, ever)
//! - [`rollup_country`] - Country summaries as the sum of their cities
//! - [`Pipeline`] - Nightly, backfill, dirty-day and per-user entry points
//! - [`Scheduler`] - Background task running the nightly cycle
//! - [`StatsDatabase`] / [`SourceDatabase`] - SQLite store and source data
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tripstats_engine::{Pipeline, PipelineSettings, SourceDatabase, Sources, StatsDatabase};
//!
//! #[tokio::main]
//! async fn main() -> tripstats_engine::Result<()> {
//!     let source = Arc::new(SourceDatabase::open("source.db")?);
//!     let stats = Arc::new(StatsDatabase::open("stats.db")?);
//!
//!     let pipeline = Pipeline::new(
//!         Sources::single(source),
//!         stats.clone(),
//!         stats,
//!         PipelineSettings::default(),
//!     );
//!
//!     let report = pipeline.run_nightly(chrono::Utc::now(), 0).await?;
//!     println!("{} scopes aggregated", report.scopes_processed);
//!     Ok(())
//! }
//! ```

pub mod daily;
pub mod db;
pub mod dedup;
pub mod error;
pub mod interval;
pub mod models;
pub mod pipeline;
pub mod rollup;
pub mod scheduler;
pub mod source_db;
pub mod sources;
pub mod store;
pub mod users;
pub mod window;

// Re-export main types
pub use daily::{DailyAggregator, LegThresholds, compute_daily_stat};
pub use db::StatsDatabase;
pub use dedup::{TripKey, dedup_in_place, dedup_parallel};
pub use error::{EngineError, Result};
pub use models::{
    Campaign, Country, DailyStat, DirtyDayMarker, IntervalSummary, LegDetail, ModeBucket,
    RunReport, Scope, StatTotals, TripRecord, UserGlobalStat, ValueFromTrip,
};
pub use pipeline::{FailurePolicy, Pipeline, PipelineSettings};
pub use rollup::rollup_country;
pub use scheduler::{CycleReport, Scheduler};
pub use source_db::{CampaignEntry, Dataset, ImportSummary, SourceDatabase, UserRecord};
pub use sources::{
    CampaignDirectory, CityDirectory, LegDetailResolver, LegResolution, Sources, TripRepository,
    UserDirectory,
};
pub use store::{DirtyDayStore, StatisticsStore};
pub use users::UserStatsBuilder;
