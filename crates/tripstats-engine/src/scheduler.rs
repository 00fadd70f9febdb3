//! Background scheduler for the nightly aggregation cycle.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tripstats_config::ScheduleConfig;
//! use tripstats_engine::{Pipeline, Scheduler};
//!
//! # async fn run(pipeline: Arc<Pipeline>) {
//! let handle = Scheduler::new(pipeline, ScheduleConfig::default()).start();
//!
//! // ... do other work ...
//!
//! handle.abort();
//! # }
//! ```

use crate::models::RunReport;
use crate::pipeline::Pipeline;
use crate::window::day_start;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tripstats_config::ScheduleConfig;

/// Runs the dirty-day, nightly and per-user stages once a day.
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    config: ScheduleConfig,
}

/// Outcome of each stage of one cycle. `None` means skipped or failed.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub dirty_days: Option<RunReport>,
    pub nightly: Option<RunReport>,
    pub users: Option<RunReport>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, config: ScheduleConfig) -> Self {
        Self { pipeline, config }
    }

    /// Start the background task.
    ///
    /// Returns a JoinHandle that can be used to abort the task.
    pub fn start(self) -> JoinHandle<()> {
        info!(run_hour = self.config.run_hour, "Starting background scheduler");

        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(&self) {
        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.config.run_hour);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next_run = %next, wait_secs = wait.as_secs(), "Waiting for next cycle");

            tokio::time::sleep(wait).await;
            self.run_once(Utc::now()).await;
        }
    }

    /// Run one cycle: dirty days, nightly, then users.
    ///
    /// A failed stage is logged and the remaining stages still run.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CycleReport {
        let mut cycle = CycleReport::default();

        if self.config.run_dirty_days {
            let limit = self.pipeline.settings().dirty_day_batch;
            match self.pipeline.run_dirty_days(limit).await {
                Ok(report) => cycle.dirty_days = Some(report),
                Err(e) => error!("Dirty-day recompute failed: {}", e),
            }
        }

        match self.pipeline.run_nightly(now, 0).await {
            Ok(report) => cycle.nightly = Some(report),
            Err(e) => error!("Nightly aggregation failed: {}", e),
        }

        if self.config.run_user_stats {
            match self.pipeline.run_user_stats(now).await {
                Ok(report) => cycle.users = Some(report),
                Err(e) => error!("User stats failed: {}", e),
            }
        }

        cycle
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }
}

/// The first `run_hour:00` UTC strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, run_hour: u32) -> DateTime<Utc> {
    let today = day_start(now) + ChronoDuration::hours(i64::from(run_hour.min(23)));
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}
