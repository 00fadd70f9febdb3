//! Write-side collaborators: the statistics store and the dirty-day queue.

use crate::error::Result;
use crate::models::{DailyStat, DirtyDayMarker, IntervalSummary, UserGlobalStat};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tripstats_core::{GeoType, ScopeType};

/// Document store for computed statistics.
///
/// Every upsert replaces the document under its composite key:
/// `(scope_type, scope_id, date)` for daily rows,
/// `(geo_type, name, date_type)` for interval summaries and
/// `(user_id, date_type)` for user stats.
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn upsert_daily(&self, stat: &DailyStat) -> Result<()>;

    async fn upsert_interval(&self, summary: &IntervalSummary) -> Result<()>;

    async fn upsert_user(&self, stat: &UserGlobalStat) -> Result<()>;

    /// All daily rows of one scope, oldest first.
    async fn query_daily(&self, scope_type: ScopeType, scope_id: &str) -> Result<Vec<DailyStat>>;

    /// All interval summaries of one geography.
    async fn query_interval(&self, geo_type: GeoType, name: &str) -> Result<Vec<IntervalSummary>>;

    async fn query_user(&self, user_id: &str) -> Result<Vec<UserGlobalStat>>;
}

/// Queue of days whose daily rows are stale.
#[async_trait]
pub trait DirtyDayStore: Send + Sync {
    /// Oldest markers first, at most `limit`.
    async fn list_pending(&self, limit: usize) -> Result<Vec<DirtyDayMarker>>;

    async fn remove(&self, date: DateTime<Utc>) -> Result<()>;

    /// Idempotent.
    async fn mark(&self, date: DateTime<Utc>) -> Result<()>;
}
