//! # tripstats-config
//!
//! YAML configuration for the tripstats binary and engine.
//!
//! Every field has a default, so an absent `~/.tripstats/config.yaml` yields a
//! working setup. An explicitly requested file that does not exist is an error.
//!
//! ```yaml
//! stats_db: /var/lib/tripstats/stats.db
//! source_db: /var/lib/tripstats/source.db
//! aggregation:
//!   cutover_hour: 4
//!   populate_days: 60
//! schedule:
//!   run_hour: 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use tripstats_core::{Result, TripstatsError};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file holding daily, interval and user statistics
    pub stats_db: PathBuf,

    /// SQLite file holding trips, legs, users, campaigns and countries
    pub source_db: PathBuf,

    /// Log directory (defaults to `~/.tripstats/logs/`)
    pub log_dir: Option<PathBuf>,

    /// Aggregation tuning
    pub aggregation: AggregationConfig,

    /// Background scheduler settings
    pub schedule: ScheduleConfig,
}

impl Default for Config {
    fn default() -> Self {
        let base = base_dir();
        Self {
            stats_db: base.join("stats.db"),
            source_db: base.join("source.db"),
            log_dir: None,
            aggregation: AggregationConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

/// Aggregation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Hour of day (UTC) at which a new statistics day begins
    pub cutover_hour: u32,

    /// Number of day offsets walked by the populate/backfill mode
    pub populate_days: u32,

    /// Maximum dirty days recomputed per batch
    pub dirty_day_batch: usize,

    /// A leg must be strictly longer than this (meters) to count
    pub min_leg_distance: f64,

    /// A leg must last strictly longer than this (seconds) to count
    pub min_leg_duration_secs: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            cutover_hour: 0,
            populate_days: 30,
            dirty_day_batch: 10,
            min_leg_distance: 5.0,
            min_leg_duration_secs: 5.0,
        }
    }
}

/// Nightly scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Hour of day (UTC) at which the nightly run starts
    pub run_hour: u32,

    /// Whether the per-user pipeline runs after the nightly aggregation
    pub run_user_stats: bool,

    /// Whether pending dirty days are recomputed at the end of a run
    pub run_dirty_days: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            run_hour: 3,
            run_user_stats: true,
            run_dirty_days: true,
        }
    }
}

impl Config {
    /// Default configuration file location: `~/.tripstats/config.yaml`.
    pub fn default_path() -> PathBuf {
        base_dir().join("config.yaml")
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TripstatsError::config_not_found_with_source(path, e)
            } else {
                TripstatsError::io("reading config", path, e)
            }
        })?;

        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| TripstatsError::ConfigInvalid {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load `path` if given, otherwise the default file if it exists,
    /// otherwise the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    debug!("no configuration file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.aggregation.cutover_hour > 23 {
            return Err(TripstatsError::config_validation(format!(
                "aggregation.cutover_hour must be 0-23, got {}",
                self.aggregation.cutover_hour
            )));
        }
        if self.schedule.run_hour > 23 {
            return Err(TripstatsError::config_validation(format!(
                "schedule.run_hour must be 0-23, got {}",
                self.schedule.run_hour
            )));
        }
        if self.aggregation.populate_days == 0 {
            return Err(TripstatsError::config_validation(
                "aggregation.populate_days must be at least 1",
            ));
        }
        if self.aggregation.dirty_day_batch == 0 {
            return Err(TripstatsError::config_validation(
                "aggregation.dirty_day_batch must be at least 1",
            ));
        }
        let thresholds = [
            self.aggregation.min_leg_distance,
            self.aggregation.min_leg_duration_secs,
        ];
        if thresholds.iter().any(|t| t.is_nan() || *t < 0.0) {
            return Err(TripstatsError::config_validation(
                "leg thresholds must be non-negative numbers",
            ));
        }
        Ok(())
    }

    /// Serialize the effective configuration.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| TripstatsError::internal(format!("serializing config: {e}")))
    }

    /// Log directory, falling back to `~/.tripstats/logs/`.
    pub fn effective_log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| base_dir().join("logs"))
    }
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tripstats")
}
