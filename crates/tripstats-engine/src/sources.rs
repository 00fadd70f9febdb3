//! Read-side collaborators the engine consumes from.
//!
//! The engine never writes through these traits. [`crate::SourceDatabase`]
//! implements all of them on SQLite; tests substitute their own.

use crate::error::{EngineError, Result};
use crate::models::{Campaign, Country, LegDetail, TripRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Raw trip lookup.
#[async_trait]
pub trait TripRepository: Send + Sync {
    /// Trips of `user_ids` starting in `[start, end)`, in arrival order.
    async fn find_by_user_and_window(
        &self,
        user_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TripRecord>>;
}

/// Answer of the leg detail resolver.
///
/// The remote service can report failure in its payload instead of failing
/// the call, so both shapes are represented.
#[derive(Debug, Clone, PartialEq)]
pub enum LegResolution {
    Legs(Vec<LegDetail>),
    Failed(String),
}

impl LegResolution {
    /// Turn a payload error into [`EngineError::Resolver`] for `scope`.
    pub fn into_result(self, scope: &str) -> Result<Vec<LegDetail>> {
        match self {
            Self::Legs(legs) => Ok(legs),
            Self::Failed(message) => Err(EngineError::resolver(scope, message)),
        }
    }
}

/// Remote enrichment of trips into legs.
#[async_trait]
pub trait LegDetailResolver: Send + Sync {
    async fn resolve(&self, trip_ids: &[String]) -> Result<LegResolution>;
}

#[async_trait]
pub trait CampaignDirectory: Send + Sync {
    async fn list_active_campaigns(&self) -> Result<Vec<Campaign>>;
}

#[async_trait]
pub trait CityDirectory: Send + Sync {
    async fn list_countries(&self) -> Result<Vec<Country>>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_user_ids(&self) -> Result<Vec<String>>;

    /// Users whose home city is `city`.
    async fn users_in_city(&self, city: &str) -> Result<Vec<String>>;
}

/// The full set of read collaborators handed to the pipeline.
#[derive(Clone)]
pub struct Sources {
    pub trips: Arc<dyn TripRepository>,
    pub resolver: Arc<dyn LegDetailResolver>,
    pub campaigns: Arc<dyn CampaignDirectory>,
    pub cities: Arc<dyn CityDirectory>,
    pub users: Arc<dyn UserDirectory>,
}

impl Sources {
    /// Use one backend for every collaborator.
    pub fn single<S>(source: Arc<S>) -> Self
    where
        S: TripRepository
            + LegDetailResolver
            + CampaignDirectory
            + CityDirectory
            + UserDirectory
            + 'static,
    {
        Self {
            trips: source.clone(),
            resolver: source.clone(),
            campaigns: source.clone(),
            cities: source.clone(),
            users: source,
        }
    }

    /// Replace the leg resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn LegDetailResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}
