//! Per-user statistics over the six lookback windows.

use crate::daily::LegThresholds;
use crate::dedup::dedup_in_place;
use crate::error::Result;
use crate::interval::accumulate_user_legs;
use crate::models::UserGlobalStat;
use crate::sources::{LegDetailResolver, TripRepository};
use crate::store::StatisticsStore;
use chrono::{DateTime, Utc};
use tracing::debug;
use tripstats_core::DateType;

/// Computes and stores the six summaries of one user.
pub struct UserStatsBuilder<'a> {
    trips: &'a dyn TripRepository,
    resolver: &'a dyn LegDetailResolver,
    store: &'a dyn StatisticsStore,
    thresholds: LegThresholds,
}

impl<'a> UserStatsBuilder<'a> {
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

    /// Rebuild the summaries of `user_id`, windows anchored at `now`.
    ///
    /// A resolver failure is returned before anything is written, so the
    /// user's previous summaries stay untouched.
    pub async fn build(&self, user_id: &str, now: DateTime<Utc>) -> Result<Vec<UserGlobalStat>> {
        let mut trips = self
            .trips
            .find_by_user_and_window(&[user_id.to_string()], DateTime::UNIX_EPOCH, now)
            .await?;
        let duplicates = dedup_in_place(&mut trips);

        let legs = if trips.is_empty() {
            Vec::new()
        } else {
            let trip_ids: Vec<String> = trips.iter().map(|t| t.trip_id.clone()).collect();
            let label = format!("user:{}", user_id);
            self.resolver
                .resolve(&trip_ids)
                .await
                .map_err(|e| e.into_resolver(&label))?
                .into_result(&label)?
        };

        let mut written = Vec::with_capacity(DateType::ALL.len());
        for date_type in DateType::ALL {
            let stat = UserGlobalStat {
                user_id: user_id.to_string(),
                date_type,
                stats: accumulate_user_legs(&trips, &legs, date_type, now, 0, self.thresholds),
            };
            self.store.upsert_user(&stat).await?;
            written.push(stat);
        }

        debug!(user_id, trips = trips.len(), duplicates, legs = legs.len(), "user stats written");
        Ok(written)
    }
}
