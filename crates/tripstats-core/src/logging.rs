//! Logging infrastructure for tripstats.
//!
//! Structured logging through the `tracing` ecosystem. The nightly pipeline
//! runs unattended, so every run leaves a JSON-lines trail on disk next to the
//! human-readable stderr output.
//!
//! ## Features
//!
//! - JSON lines format for machine parsing
//! - Daily-rolling file output to `<log_dir>/tripstats.log`
//! - Console output with configurable verbosity
//!
//! ## Example
//!
//! ```no_run
//! use tripstats_core::logging;
//!
//! let _guard = logging::init_logging("/var/log/tripstats".into(), false).expect("logging init");
//!
//! tracing::info!("tripstats started");
//! tracing::debug!(scope_id = "Lisbon", "aggregating city");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{Result, TripstatsError};

/// Name of the rolling log file inside the log directory.
pub const LOG_FILE_NAME: &str = "tripstats.log";

/// Guard that must be held to ensure log flushing on shutdown.
///
/// Keep this guard alive for the lifetime of the process.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the tripstats logging system.
///
/// This sets up:
/// - File logging to `<log_dir>/tripstats.log` (JSON lines, rotated daily)
/// - Console logging to stderr (compact, human-readable)
///
/// `RUST_LOG` takes precedence over the default filter, which is
/// `tripstats=info` or `tripstats=debug` when `verbose` is set.
pub fn init_logging(log_dir: PathBuf, verbose: bool) -> Result<LogGuard> {
    std::fs::create_dir_all(&log_dir).map_err(|e| TripstatsError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tripstats={default_level}")));

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| TripstatsError::internal(format!("logging already initialized: {e}")))?;

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize minimal console-only logging for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Log a uniform event for one aggregation scope.
///
/// # Example
///
/// ```ignore
/// log_scope_event!("city", "Lisbon", "aggregated");
/// log_scope_event!("campaign", "c-17", "skipped", reason = "resolver error");
/// ```
#[macro_export]
macro_rules! log_scope_event {
    ($scope_type:expr, $scope_id:expr, $event:expr) => {
        tracing::info!(
            target: "tripstats::scope",
            scope_type = %$scope_type,
            scope_id = %$scope_id,
            event = $event,
            "scope event"
        )
    };
    ($scope_type:expr, $scope_id:expr, $event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "tripstats::scope",
            scope_type = %$scope_type,
            scope_id = %$scope_id,
            event = $event,
            $($field)*,
            "scope event"
        )
    };
}
