//! Shared type definitions used across tripstats crates.
//!
//! The string forms of these enums are the keys written to the statistics
//! store, so they must stay stable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scope of a daily statistics row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    /// All users living in one city
    City,
    /// All members of one campaign
    Campaign,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::City => "city",
            Self::Campaign => "campaign",
        }
    }

    /// The interval summary geography this scope rolls up into.
    pub fn geo_type(&self) -> GeoType {
        match self {
            Self::City => GeoType::City,
            Self::Campaign => GeoType::Campaign,
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "city" => Ok(Self::City),
            "campaign" => Ok(Self::Campaign),
            other => Err(format!("unknown scope type: {other}")),
        }
    }
}

/// Geography of an interval summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoType {
    City,
    Campaign,
    /// Roll-up of all cities in a country
    Country,
}

impl GeoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::City => "city",
            Self::Campaign => "campaign",
            Self::Country => "country",
        }
    }
}

impl fmt::Display for GeoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeoType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "city" => Ok(Self::City),
            "campaign" => Ok(Self::Campaign),
            "country" => Ok(Self::Country),
            other => Err(format!("unknown geo type: {other}")),
        }
    }
}

/// One of the six canonical lookback windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DateType {
    #[serde(rename = "day1")]
    Day1,
    #[serde(rename = "day3")]
    Day3,
    #[serde(rename = "day7")]
    Day7,
    #[serde(rename = "day30")]
    Day30,
    #[serde(rename = "day365")]
    Day365,
    /// All time, no date filtering
    #[serde(rename = "ever")]
    Ever,
}

impl DateType {
    /// Every window, in the order summaries are produced.
    pub const ALL: [DateType; 6] = [
        Self::Day1,
        Self::Day3,
        Self::Day7,
        Self::Day30,
        Self::Day365,
        Self::Ever,
    ];

    /// Window length in days, `None` for [`DateType::Ever`].
    pub fn days(&self) -> Option<i64> {
        match self {
            Self::Day1 => Some(1),
            Self::Day3 => Some(3),
            Self::Day7 => Some(7),
            Self::Day30 => Some(30),
            Self::Day365 => Some(365),
            Self::Ever => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day1 => "day1",
            Self::Day3 => "day3",
            Self::Day7 => "day7",
            Self::Day30 => "day30",
            Self::Day365 => "day365",
            Self::Ever => "ever",
        }
    }
}

impl fmt::Display for DateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown date type: {s}"))
    }
}
