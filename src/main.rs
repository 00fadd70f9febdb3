//! tripstats - rolling mobility statistics
//!
//! Aggregates survey trips into daily, interval, country and per-user
//! statistics.
//!
//! ## Usage
//!
//! ```bash
//! # Load source data
//! tripstats import dataset.json
//!
//! # Seed the last 30 days, then run the nightly pipeline
//! tripstats populate --days 30
//! tripstats nightly
//!
//! # Run the scheduler in the foreground
//! tripstats -v daemon
//!
//! # Inspect a country's summaries
//! tripstats show country Portugal
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tripstats_config::Config;
use tripstats_core::{GeoType, LogGuard, init_logging};
use tripstats_engine::{
    Dataset, Pipeline, PipelineSettings, Scheduler, SourceDatabase, Sources, StatsDatabase,
};

/// Rolling mobility statistics for trip survey data.
#[derive(Parser, Debug)]
#[command(name = "tripstats")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (defaults to ~/.tripstats/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for log files (defaults to ~/.tripstats/logs/)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Daily rows for every city and campaign, then interval refresh
    Nightly {
        /// Days before the latest cutover to aggregate
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Backfill daily rows for the last N days
    Populate {
        /// Number of days (defaults to aggregation.populate_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Recompute queued dirty days
    DirtyDays {
        /// Maximum days to process (defaults to aggregation.dirty_day_batch)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Refresh interval summaries and country roll-ups
    Intervals,

    /// Refresh per-user summaries
    Users,

    /// Run the nightly scheduler until Ctrl-C
    Daemon,

    /// Load a JSON dataset into the source database
    Import {
        /// Dataset file
        file: PathBuf,
    },

    /// Print stored interval summaries as JSON
    Show {
        /// city, campaign or country
        scope_type: GeoType,
        /// City or country name, or campaign id
        name: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            if let Some(hint) = e.guidance() {
                eprintln!("{}", hint);
            }
            return ExitCode::from(2);
        }
    };

    let _guard = match setup_logging(&cli, &config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("tripstats error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Set up logging based on CLI arguments and configuration.
fn setup_logging(cli: &Cli, config: &Config) -> tripstats_core::Result<LogGuard> {
    let log_dir = cli
        .log_dir
        .clone()
        .unwrap_or_else(|| config.effective_log_dir());
    init_logging(log_dir, cli.verbose > 0)
}

/// Databases and pipeline shared by the engine commands.
struct Engine {
    source: Arc<SourceDatabase>,
    stats: Arc<StatsDatabase>,
    pipeline: Arc<Pipeline>,
}

impl Engine {
    fn open(config: &Config) -> Result<Self> {
        let source = Arc::new(open_source(&config.source_db)?);
        let stats = Arc::new(open_stats(&config.stats_db)?);
        let pipeline = Arc::new(Pipeline::new(
            Sources::single(source.clone()),
            stats.clone(),
            stats.clone(),
            PipelineSettings::from(&config.aggregation),
        ));
        Ok(Self {
            source,
            stats,
            pipeline,
        })
    }
}

async fn run(command: Command, config: Config) -> Result<()> {
    let now = Utc::now();

    match command {
        Command::Nightly { offset } => {
            let engine = Engine::open(&config)?;
            print_json(&engine.pipeline.run_nightly(now, offset).await?)?;
        }
        Command::Populate { days } => {
            let engine = Engine::open(&config)?;
            let days = days.unwrap_or(config.aggregation.populate_days);
            let mut report = engine.pipeline.populate(now, days).await?;
            report.merge(&engine.pipeline.refresh_intervals(now, 0).await?);
            print_json(&report)?;
        }
        Command::DirtyDays { limit } => {
            let engine = Engine::open(&config)?;
            let limit = limit.unwrap_or(config.aggregation.dirty_day_batch);
            print_json(&engine.pipeline.run_dirty_days(limit).await?)?;
        }
        Command::Intervals => {
            let engine = Engine::open(&config)?;
            print_json(&engine.pipeline.refresh_intervals(now, 0).await?)?;
        }
        Command::Users => {
            let engine = Engine::open(&config)?;
            print_json(&engine.pipeline.run_user_stats(now).await?)?;
        }
        Command::Daemon => {
            let engine = Engine::open(&config)?;
            let handle = Scheduler::new(engine.pipeline, config.schedule.clone()).start();
            info!("Scheduler running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            handle.abort();
            info!("Scheduler stopped");
        }
        Command::Import { file } => {
            let engine = Engine::open(&config)?;
            let dataset = Dataset::from_file(&file)
                .with_context(|| format!("failed to read dataset {}", file.display()))?;
            let summary = engine.source.import(&dataset)?;
            let dirty = engine.pipeline.mark_dirty_for_trips(&dataset.trips, now).await?;
            info!(dirty_days = dirty, "Import finished");
            print_json(&summary)?;
        }
        Command::Show { scope_type, name } => {
            let engine = Engine::open(&config)?;
            let summaries = engine.stats.get_intervals(scope_type, &name)?;
            if summaries.is_empty() {
                anyhow::bail!("no summaries stored for {} {}", scope_type, name);
            }
            print_json(&summaries)?;
        }
        Command::Config => {
            print!("{}", config.to_yaml()?);
        }
    }

    Ok(())
}

fn open_source(path: &Path) -> Result<SourceDatabase> {
    ensure_parent(path)?;
    SourceDatabase::open(path)
        .with_context(|| format!("failed to open source database {}", path.display()))
}

fn open_stats(path: &Path) -> Result<StatsDatabase> {
    ensure_parent(path)?;
    StatsDatabase::open(path)
        .with_context(|| format!("failed to open statistics database {}", path.display()))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
