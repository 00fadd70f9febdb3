//! SQLite-backed source data: users, trips, resolved legs, campaigns and
//! the country/city directory.
//!
//! Implements every read-side trait so the whole engine can run locally.
//! Trips are kept in arrival order (rowid) and may contain duplicates; the
//! engine deduplicates them.

use crate::error::{EngineError, Result};
use crate::models::{Campaign, Country, LegDetail, TripRecord, ValueFromTrip};
use crate::sources::{
    CampaignDirectory, CityDirectory, LegDetailResolver, LegResolution, TripRepository,
    UserDirectory,
};
use crate::window::{from_millis, to_millis};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on bound parameters per `IN (...)` query.
const QUERY_CHUNK: usize = 500;

/// A user and their home city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    #[serde(default)]
    pub city: Option<String>,
}

/// Campaign entry of an import file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignEntry {
    #[serde(flatten)]
    pub campaign: Campaign,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Contents of an import file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataset {
    pub users: Vec<UserRecord>,
    pub trips: Vec<TripRecord>,
    pub legs: Vec<LegDetail>,
    pub campaigns: Vec<CampaignEntry>,
    pub countries: Vec<Country>,
}

impl Dataset {
    /// Read a dataset from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Row counts written by [`SourceDatabase::import`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub users: usize,
    pub trips: usize,
    pub legs: usize,
    pub campaigns: usize,
    pub countries: usize,
}

/// SQLite database for source data.
pub struct SourceDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SourceDatabase {
    /// Open or create a source database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(1))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Repository(format!("failed to acquire lock: {}", e)))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                city TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_users_city ON users(city);

            CREATE TABLE IF NOT EXISTS trips (
                trip_id TEXT NOT NULL,
                user_id TEXT,
                start_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_trips_user_start ON trips(user_id, start_ms);

            CREATE TABLE IF NOT EXISTS legs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trip_id TEXT NOT NULL,
                user_id TEXT,
                start_ms INTEGER,
                end_ms INTEGER,
                distance REAL,
                corrected_mode INTEGER,
                wasted_time REAL,
                value_from_trip TEXT NOT NULL DEFAULT '[]',
                overall_score REAL
            );
            CREATE INDEX IF NOT EXISTS idx_legs_trip ON legs(trip_id);

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS campaign_members (
                campaign_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (campaign_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS countries (
                country TEXT NOT NULL,
                city TEXT NOT NULL,
                PRIMARY KEY (country, city)
            );",
        )?;
        Ok(())
    }

    /// Insert or replace users.
    pub fn insert_users(&self, users: &[UserRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO users (user_id, city) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET city = excluded.city",
            )?;
            for user in users {
                stmt.execute(params![user.user_id, user.city])?;
            }
        }
        tx.commit()?;
        debug!(count = users.len(), "Inserted users");
        Ok(users.len())
    }

    /// Append trips. Duplicates are kept as they arrive.
    pub fn insert_trips(&self, trips: &[TripRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO trips (trip_id, user_id, start_ms) VALUES (?1, ?2, ?3)",
            )?;
            for trip in trips {
                stmt.execute(params![
                    trip.trip_id,
                    trip.user_id,
                    trip.start_date.map(to_millis),
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = trips.len(), "Inserted trips");
        Ok(trips.len())
    }

    /// Append resolved legs.
    pub fn insert_legs(&self, legs: &[LegDetail]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO legs
                 (trip_id, user_id, start_ms, end_ms, distance, corrected_mode,
                  wasted_time, value_from_trip, overall_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for leg in legs {
                stmt.execute(params![
                    leg.trip_id,
                    leg.user_id,
                    leg.start_date.map(to_millis),
                    leg.end_date.map(to_millis),
                    leg.distance,
                    leg.corrected_mode,
                    leg.wasted_time,
                    serde_json::to_string(&leg.value_from_trip)?,
                    leg.overall_score,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = legs.len(), "Inserted legs");
        Ok(legs.len())
    }

    /// Insert or replace a campaign and its member list.
    pub fn insert_campaign(&self, campaign: &Campaign, active: bool) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO campaigns (id, name, active) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, active = excluded.active",
            params![campaign.id, campaign.name, active],
        )?;
        tx.execute(
            "DELETE FROM campaign_members WHERE campaign_id = ?1",
            params![campaign.id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO campaign_members (campaign_id, user_id) VALUES (?1, ?2)",
            )?;
            for user_id in &campaign.member_user_ids {
                stmt.execute(params![campaign.id, user_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Register the cities of a country.
    pub fn insert_country(&self, country: &Country) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO countries (country, city) VALUES (?1, ?2)",
            )?;
            for city in &country.cities {
                stmt.execute(params![country.name, city])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Load a whole dataset.
    pub fn import(&self, dataset: &Dataset) -> Result<ImportSummary> {
        let summary = ImportSummary {
            users: self.insert_users(&dataset.users)?,
            trips: self.insert_trips(&dataset.trips)?,
            legs: self.insert_legs(&dataset.legs)?,
            campaigns: dataset.campaigns.len(),
            countries: dataset.countries.len(),
        };
        for entry in &dataset.campaigns {
            self.insert_campaign(&entry.campaign, entry.active)?;
        }
        for country in &dataset.countries {
            self.insert_country(country)?;
        }
        info!(
            users = summary.users,
            trips = summary.trips,
            legs = summary.legs,
            campaigns = summary.campaigns,
            countries = summary.countries,
            "Imported dataset"
        );
        Ok(summary)
    }

    fn query_trips(
        &self,
        user_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TripRecord>> {
        let conn = self.lock()?;
        let mut rows: Vec<(i64, TripRecord)> = Vec::new();

        for chunk in user_ids.chunks(QUERY_CHUNK) {
            let sql = format!(
                "SELECT rowid, trip_id, user_id, start_ms FROM trips
                 WHERE start_ms >= ?1 AND start_ms < ?2 AND user_id IN ({})",
                placeholders(chunk.len(), 3)
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut values = vec![Value::Integer(to_millis(start)), Value::Integer(to_millis(end))];
            values.extend(chunk.iter().map(|id| Value::Text(id.clone())));

            let chunk_rows = stmt
                .query_map(params_from_iter(values), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        TripRecord {
                            trip_id: row.get(1)?,
                            user_id: row.get(2)?,
                            start_date: row.get::<_, Option<i64>>(3)?.map(from_millis),
                        },
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.extend(chunk_rows);
        }

        rows.sort_by_key(|(rowid, _)| *rowid);
        Ok(rows.into_iter().map(|(_, trip)| trip).collect())
    }

    fn query_legs(&self, trip_ids: &[String]) -> Result<Vec<LegDetail>> {
        let conn = self.lock()?;
        let mut rows: Vec<(i64, LegDetail)> = Vec::new();

        for chunk in trip_ids.chunks(QUERY_CHUNK) {
            let sql = format!(
                "SELECT id, trip_id, user_id, start_ms, end_ms, distance, corrected_mode,
                        wasted_time, value_from_trip, overall_score
                 FROM legs WHERE trip_id IN ({})",
                placeholders(chunk.len(), 1)
            );
            let mut stmt = conn.prepare(&sql)?;
            let raw = stmt
                .query_map(params_from_iter(chunk.iter()), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        LegDetail {
                            trip_id: row.get(1)?,
                            user_id: row.get(2)?,
                            start_date: row.get::<_, Option<i64>>(3)?.map(from_millis),
                            end_date: row.get::<_, Option<i64>>(4)?.map(from_millis),
                            distance: row.get(5)?,
                            corrected_mode: row.get(6)?,
                            wasted_time: row.get(7)?,
                            value_from_trip: Vec::new(),
                            overall_score: row.get(9)?,
                        },
                        row.get::<_, String>(8)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (id, mut leg, values) in raw {
                leg.value_from_trip = serde_json::from_str::<Vec<ValueFromTrip>>(&values)?;
                rows.push((id, leg));
            }
        }

        rows.sort_by_key(|(id, _)| *id);
        Ok(rows.into_iter().map(|(_, leg)| leg).collect())
    }

    fn query_campaigns(&self) -> Result<Vec<Campaign>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, m.user_id
             FROM campaigns c
             LEFT JOIN campaign_members m ON m.campaign_id = c.id
             WHERE c.active = 1
             ORDER BY c.id, m.user_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut campaigns: Vec<Campaign> = Vec::new();
        for (id, name, member) in rows {
            if campaigns.last().is_none_or(|c| c.id != id) {
                campaigns.push(Campaign {
                    id,
                    name,
                    member_user_ids: Vec::new(),
                });
            }
            if let (Some(campaign), Some(member)) = (campaigns.last_mut(), member) {
                campaign.member_user_ids.push(member);
            }
        }
        Ok(campaigns)
    }

    fn query_countries(&self) -> Result<Vec<Country>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT country, city FROM countries ORDER BY country, city")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (country, city) in rows {
            grouped.entry(country).or_default().push(city);
        }
        Ok(grouped
            .into_iter()
            .map(|(name, cities)| Country { name, cities })
            .collect())
    }

    fn query_user_ids(&self, city: Option<&str>) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let ids = match city {
            Some(city) => {
                let mut stmt =
                    conn.prepare("SELECT user_id FROM users WHERE city = ?1 ORDER BY user_id")?;
                stmt.query_map(params![city], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?
            }
            None => {
                let mut stmt = conn.prepare("SELECT user_id FROM users ORDER BY user_id")?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?
            }
        };
        Ok(ids)
    }
}

/// `?n, ?n+1, ...` for `count` parameters.
fn placeholders(count: usize, first: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl TripRepository for SourceDatabase {
    async fn find_by_user_and_window(
        &self,
        user_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TripRecord>> {
        self.query_trips(user_ids, start, end)
    }
}

#[async_trait]
impl LegDetailResolver for SourceDatabase {
    async fn resolve(&self, trip_ids: &[String]) -> Result<LegResolution> {
        Ok(LegResolution::Legs(self.query_legs(trip_ids)?))
    }
}

#[async_trait]
impl CampaignDirectory for SourceDatabase {
    async fn list_active_campaigns(&self) -> Result<Vec<Campaign>> {
        self.query_campaigns()
    }
}

#[async_trait]
impl CityDirectory for SourceDatabase {
    async fn list_countries(&self) -> Result<Vec<Country>> {
        self.query_countries()
    }
}

#[async_trait]
impl UserDirectory for SourceDatabase {
    async fn list_user_ids(&self) -> Result<Vec<String>> {
        self.query_user_ids(None)
    }

    async fn users_in_city(&self, city: &str) -> Result<Vec<String>> {
        self.query_user_ids(Some(city))
    }
}
