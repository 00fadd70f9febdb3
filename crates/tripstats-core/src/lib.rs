//! # tripstats-core
//!
//! Core types, errors, and utilities shared by the tripstats crates.
//!
//! This crate provides:
//! - [`TripstatsError`] - Error types for configuration, I/O and setup
//! - [`logging`] - Tracing setup and log file management
//! - [`types`] - Scope, geography and interval labels used across the engine
//!
//! ## Example
//!
//! ```no_run
//! use tripstats_core::{TripstatsError, logging};
//!
//! fn main() -> tripstats_core::Result<()> {
//!     let _guard = logging::init_logging("/var/log/tripstats".into(), false)?;
//!
//!     let config_path = std::path::Path::new("~/.tripstats/config.yaml");
//!     if !config_path.exists() {
//!         return Err(TripstatsError::config_not_found(config_path));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Result, TripstatsError};
pub use logging::{LogGuard, init_logging};
pub use types::{DateType, GeoType, ScopeType};
