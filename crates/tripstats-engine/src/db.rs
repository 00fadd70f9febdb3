//! SQLite statistics store.
//!
//! Each statistics document is stored as JSON under its composite key, so an
//! upsert replaces the whole document and reruns never double-count.

use crate::error::{EngineError, Result, is_database_locked_error};
use crate::models::{DailyStat, DirtyDayMarker, IntervalSummary, StatTotals, UserGlobalStat};
use crate::store::{DirtyDayStore, StatisticsStore};
use crate::window::{from_millis, to_millis};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use tripstats_core::{DateType, GeoType, ScopeType};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 2;

/// Maximum retries for database lock errors.
const DB_LOCK_MAX_RETRIES: u32 = 5;

/// Initial delay for database lock retry (in milliseconds).
const DB_LOCK_INITIAL_DELAY_MS: u64 = 50;

/// Maximum delay for database lock retry.
const DB_LOCK_MAX_DELAY: Duration = Duration::from_secs(5);

/// SQLite database for computed statistics and the dirty-day queue.
///
/// Clones share one connection.
#[derive(Clone)]
pub struct StatsDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl StatsDatabase {
    /// Open or create a statistics database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(1))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Store(format!("failed to acquire lock: {}", e)))
    }

    /// Execute a database operation with automatic retry on lock errors.
    fn with_retry<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(DB_LOCK_INITIAL_DELAY_MS);

        loop {
            attempt += 1;

            match f() {
                Ok(result) => {
                    if attempt > 1 {
                        info!(attempt, operation, "Database operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(ref e) if is_database_locked_error(e) && attempt <= DB_LOCK_MAX_RETRIES => {
                    warn!(
                        attempt,
                        max_retries = DB_LOCK_MAX_RETRIES,
                        delay_ms = delay.as_millis(),
                        operation,
                        "Database locked, retrying with backoff"
                    );

                    std::thread::sleep(delay);
                    delay = std::cmp::min(delay * 2, DB_LOCK_MAX_DELAY);
                }
                Err(e) => {
                    if attempt > 1 {
                        warn!(attempt, operation, error = %e, "Database operation failed after retries");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Run a synchronous store call on the blocking pool.
    ///
    /// Lock retries sleep the calling thread, so async callers never run
    /// `with_retry` on a runtime worker.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&StatsDatabase) -> Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| EngineError::Store(format!("blocking task failed: {}", e)))?
    }

    /// Run database migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Migration(format!("failed to acquire lock: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                current = current_version,
                target = SCHEMA_VERSION,
                "Running statistics database migrations"
            );
            if current_version < 1 {
                migration_v1(&conn)?;
            }
            if current_version < 2 {
                migration_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Write one daily row.
    pub fn put_daily(&self, stat: &DailyStat) -> Result<()> {
        let body = serde_json::to_string(&stat.stats)?;
        self.with_retry("upsert_daily", || {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO daily_stats (scope_type, scope_id, date_ms, stats, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(scope_type, scope_id, date_ms) DO UPDATE SET
                    stats = excluded.stats,
                    last_updated = excluded.last_updated",
                params![
                    stat.scope_type.as_str(),
                    stat.scope_id,
                    to_millis(stat.date),
                    body,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        debug!(scope_type = %stat.scope_type, scope_id = %stat.scope_id, date = %stat.date, "Upserted daily stat");
        Ok(())
    }

    /// Write one interval summary.
    pub fn put_interval(&self, summary: &IntervalSummary) -> Result<()> {
        let body = serde_json::to_string(&summary.stats)?;
        self.with_retry("upsert_interval", || {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO interval_stats (geo_type, name, date_type, stats, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(geo_type, name, date_type) DO UPDATE SET
                    stats = excluded.stats,
                    last_updated = excluded.last_updated",
                params![
                    summary.geo_type.as_str(),
                    summary.name,
                    summary.date_type.as_str(),
                    body,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Write one user summary.
    pub fn put_user(&self, stat: &UserGlobalStat) -> Result<()> {
        let body = serde_json::to_string(&stat.stats)?;
        self.with_retry("upsert_user", || {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO user_stats (user_id, date_type, stats, last_updated)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, date_type) DO UPDATE SET
                    stats = excluded.stats,
                    last_updated = excluded.last_updated",
                params![
                    stat.user_id,
                    stat.date_type.as_str(),
                    body,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Daily rows of one scope, oldest first.
    pub fn get_daily(&self, scope_type: ScopeType, scope_id: &str) -> Result<Vec<DailyStat>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT date_ms, stats FROM daily_stats
             WHERE scope_type = ?1 AND scope_id = ?2
             ORDER BY date_ms",
        )?;

        let rows = stmt
            .query_map(params![scope_type.as_str(), scope_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(date_ms, body)| {
                Ok(DailyStat {
                    scope_type,
                    scope_id: scope_id.to_string(),
                    date: from_millis(date_ms),
                    stats: serde_json::from_str(&body)?,
                })
            })
            .collect()
    }

    /// One daily row, if present.
    pub fn get_daily_at(
        &self,
        scope_type: ScopeType,
        scope_id: &str,
        date: DateTime<Utc>,
    ) -> Result<Option<DailyStat>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT stats FROM daily_stats
                 WHERE scope_type = ?1 AND scope_id = ?2 AND date_ms = ?3",
                params![scope_type.as_str(), scope_id, to_millis(date)],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|body| {
            Ok(DailyStat {
                scope_type,
                scope_id: scope_id.to_string(),
                date,
                stats: serde_json::from_str(&body)?,
            })
        })
        .transpose()
    }

    /// Raw stored JSON of one daily row.
    pub fn daily_document(
        &self,
        scope_type: ScopeType,
        scope_id: &str,
        date: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT stats FROM daily_stats
                 WHERE scope_type = ?1 AND scope_id = ?2 AND date_ms = ?3",
                params![scope_type.as_str(), scope_id, to_millis(date)],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Interval summaries of one geography, in window order.
    pub fn get_intervals(&self, geo_type: GeoType, name: &str) -> Result<Vec<IntervalSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT date_type, stats FROM interval_stats WHERE geo_type = ?1 AND name = ?2",
        )?;

        let rows = stmt
            .query_map(params![geo_type.as_str(), name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (date_type, body) in rows {
            let Some(date_type) = parse_date_type(&date_type) else {
                continue;
            };
            summaries.push(IntervalSummary {
                geo_type,
                name: name.to_string(),
                date_type,
                stats: serde_json::from_str::<StatTotals>(&body)?,
            });
        }
        summaries.sort_by_key(|s| s.date_type);
        Ok(summaries)
    }

    /// User summaries, in window order.
    pub fn get_user(&self, user_id: &str) -> Result<Vec<UserGlobalStat>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT date_type, stats FROM user_stats WHERE user_id = ?1")?;

        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = Vec::with_capacity(rows.len());
        for (date_type, body) in rows {
            let Some(date_type) = parse_date_type(&date_type) else {
                continue;
            };
            stats.push(UserGlobalStat {
                user_id: user_id.to_string(),
                date_type,
                stats: serde_json::from_str(&body)?,
            });
        }
        stats.sort_by_key(|s| s.date_type);
        Ok(stats)
    }

    /// Number of stored daily rows across all scopes.
    pub fn count_daily(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM daily_stats", [], |row| row.get(0))?)
    }

    /// Queue `date` for recomputation.
    pub fn mark_dirty(&self, date: DateTime<Utc>) -> Result<()> {
        self.with_retry("mark_dirty", || {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO dirty_days (date_ms, marked_at) VALUES (?1, ?2)
                 ON CONFLICT(date_ms) DO NOTHING",
                params![to_millis(date), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Oldest pending dirty days.
    pub fn pending_dirty(&self, limit: usize) -> Result<Vec<DirtyDayMarker>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT date_ms FROM dirty_days ORDER BY date_ms ASC LIMIT ?1")?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let markers = stmt
            .query_map(params![limit], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|ms| DirtyDayMarker { date: from_millis(ms) }))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(markers)
    }

    /// Remove the marker for `date`.
    pub fn clear_dirty(&self, date: DateTime<Utc>) -> Result<()> {
        self.with_retry("clear_dirty", || {
            let conn = self.lock()?;
            conn.execute("DELETE FROM dirty_days WHERE date_ms = ?1", params![to_millis(date)])?;
            Ok(())
        })
    }
}

fn parse_date_type(value: &str) -> Option<DateType> {
    match value.parse() {
        Ok(date_type) => Some(date_type),
        Err(e) => {
            warn!(error = %e, "Skipping stored summary with unknown date type");
            None
        }
    }
}

/// Migration to version 1: statistics documents.
fn migration_v1(conn: &Connection) -> Result<()> {
    debug!("Running migration v1: statistics documents");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS daily_stats (
            scope_type TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            date_ms INTEGER NOT NULL,
            stats TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            PRIMARY KEY (scope_type, scope_id, date_ms)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS interval_stats (
            geo_type TEXT NOT NULL,
            name TEXT NOT NULL,
            date_type TEXT NOT NULL,
            stats TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            PRIMARY KEY (geo_type, name, date_type)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_stats (
            user_id TEXT NOT NULL,
            date_type TEXT NOT NULL,
            stats TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            PRIMARY KEY (user_id, date_type)
        )",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    info!("Migration v1 completed");
    Ok(())
}

/// Migration to version 2: dirty-day queue.
fn migration_v2(conn: &Connection) -> Result<()> {
    debug!("Running migration v2: dirty days");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dirty_days (
            date_ms INTEGER PRIMARY KEY,
            marked_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;

    info!("Migration v2 completed: dirty days");
    Ok(())
}

#[async_trait]
impl StatisticsStore for StatsDatabase {
    async fn upsert_daily(&self, stat: &DailyStat) -> Result<()> {
        let stat = stat.clone();
        self.blocking(move |db| db.put_daily(&stat)).await
    }

    async fn upsert_interval(&self, summary: &IntervalSummary) -> Result<()> {
        let summary = summary.clone();
        self.blocking(move |db| db.put_interval(&summary)).await
    }

    async fn upsert_user(&self, stat: &UserGlobalStat) -> Result<()> {
        let stat = stat.clone();
        self.blocking(move |db| db.put_user(&stat)).await
    }

    async fn query_daily(&self, scope_type: ScopeType, scope_id: &str) -> Result<Vec<DailyStat>> {
        let scope_id = scope_id.to_string();
        self.blocking(move |db| db.get_daily(scope_type, &scope_id))
            .await
    }

    async fn query_interval(&self, geo_type: GeoType, name: &str) -> Result<Vec<IntervalSummary>> {
        let name = name.to_string();
        self.blocking(move |db| db.get_intervals(geo_type, &name)).await
    }

    async fn query_user(&self, user_id: &str) -> Result<Vec<UserGlobalStat>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.get_user(&user_id)).await
    }
}

#[async_trait]
impl DirtyDayStore for StatsDatabase {
    async fn list_pending(&self, limit: usize) -> Result<Vec<DirtyDayMarker>> {
        self.blocking(move |db| db.pending_dirty(limit)).await
    }

    async fn remove(&self, date: DateTime<Utc>) -> Result<()> {
        self.blocking(move |db| db.clear_dirty(date)).await
    }

    async fn mark(&self, date: DateTime<Utc>) -> Result<()> {
        self.blocking(move |db| db.mark_dirty(date)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModeBucket;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, d, 0, 0, 0).unwrap()
    }

    fn daily(scope_id: &str, date: DateTime<Utc>, legs: u64) -> DailyStat {
        DailyStat {
            scope_type: ScopeType::City,
            scope_id: scope_id.into(),
            date,
            stats: StatTotals {
                total_legs: legs,
                corrected_modes: vec![ModeBucket::new(2)],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_open_in_memory() {
        let db = StatsDatabase::open_in_memory().expect("Failed to open in-memory db");
        let conn = db.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in ["daily_stats", "interval_stats", "user_stats", "dirty_days"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_daily_upsert_replaces() {
        let db = StatsDatabase::open_in_memory().unwrap();

        db.put_daily(&daily("Lisbon", day(2), 3)).unwrap();
        db.put_daily(&daily("Lisbon", day(2), 5)).unwrap();
        db.put_daily(&daily("Lisbon", day(1), 1)).unwrap();

        let rows = db.get_daily(ScopeType::City, "Lisbon").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, day(1));
        assert_eq!(rows[1].stats.total_legs, 5);
        assert_eq!(db.count_daily().unwrap(), 2);
    }

    #[test]
    fn test_daily_keys_are_scoped() {
        let db = StatsDatabase::open_in_memory().unwrap();
        let mut campaign = daily("Lisbon", day(2), 9);
        campaign.scope_type = ScopeType::Campaign;

        db.put_daily(&daily("Lisbon", day(2), 3)).unwrap();
        db.put_daily(&campaign).unwrap();

        let city = db.get_daily_at(ScopeType::City, "Lisbon", day(2)).unwrap().unwrap();
        assert_eq!(city.stats.total_legs, 3);
        assert!(db.get_daily_at(ScopeType::City, "Lisbon", day(3)).unwrap().is_none());
        assert_eq!(db.get_daily(ScopeType::Campaign, "Lisbon").unwrap()[0].stats.total_legs, 9);
    }

    #[test]
    fn test_interval_round_trip_in_window_order() {
        let db = StatsDatabase::open_in_memory().unwrap();
        for date_type in DateType::ALL.iter().rev() {
            db.put_interval(&IntervalSummary {
                geo_type: GeoType::Country,
                name: "Portugal".into(),
                date_type: *date_type,
                stats: StatTotals::default(),
            })
            .unwrap();
        }

        let summaries = db.get_intervals(GeoType::Country, "Portugal").unwrap();
        let labels: Vec<DateType> = summaries.iter().map(|s| s.date_type).collect();
        assert_eq!(labels, DateType::ALL.to_vec());
        assert!(db.get_intervals(GeoType::City, "Portugal").unwrap().is_empty());
    }

    #[test]
    fn test_user_stats_upsert() {
        let db = StatsDatabase::open_in_memory().unwrap();
        let mut stat = UserGlobalStat {
            user_id: "u1".into(),
            date_type: DateType::Day7,
            stats: StatTotals::default(),
        };
        db.put_user(&stat).unwrap();
        stat.stats.total_legs = 4;
        db.put_user(&stat).unwrap();

        let stored = db.get_user("u1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].stats.total_legs, 4);
    }

    #[test]
    fn test_dirty_days_oldest_first() {
        let db = StatsDatabase::open_in_memory().unwrap();
        db.mark_dirty(day(5)).unwrap();
        db.mark_dirty(day(3)).unwrap();
        db.mark_dirty(day(5)).unwrap();
        db.mark_dirty(day(9)).unwrap();

        let pending = db.pending_dirty(2).unwrap();
        assert_eq!(pending, vec![DirtyDayMarker { date: day(3) }, DirtyDayMarker { date: day(5) }]);

        db.clear_dirty(day(3)).unwrap();
        assert_eq!(db.pending_dirty(10).unwrap().len(), 2);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.db");

        {
            let db = StatsDatabase::open(&path).unwrap();
            db.put_daily(&daily("Porto", day(4), 2)).unwrap();
        }

        let db = StatsDatabase::open(&path).unwrap();
        assert_eq!(db.get_daily(ScopeType::City, "Porto").unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_traits_share_connection() {
        let db = StatsDatabase::open_in_memory().unwrap();
        let store: &dyn StatisticsStore = &db;
        let dirty: &dyn DirtyDayStore = &db;

        store.upsert_daily(&daily("Lisbon", day(2), 4)).await.unwrap();
        dirty.mark(day(2)).await.unwrap();

        let rows = store.query_daily(ScopeType::City, "Lisbon").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stats.total_legs, 4);
        assert_eq!(db.pending_dirty(10).unwrap(), vec![DirtyDayMarker { date: day(2) }]);

        dirty.remove(day(2)).await.unwrap();
        assert!(dirty.list_pending(10).await.unwrap().is_empty());
    }
}
