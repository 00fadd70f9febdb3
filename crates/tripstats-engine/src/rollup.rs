//! Country roll-up of city interval summaries.

use crate::models::{IntervalSummary, StatTotals};
use tripstats_core::{DateType, GeoType};

/// Sum city summaries label by label into six country summaries.
///
/// Summaries of other geographies are ignored. A country without city data
/// still gets six zero-valued rows.
pub fn rollup_country(country: &str, city_summaries: &[IntervalSummary]) -> Vec<IntervalSummary> {
    DateType::ALL
        .iter()
        .map(|&date_type| {
            let stats = StatTotals::sum(
                city_summaries
                    .iter()
                    .filter(|s| s.geo_type == GeoType::City && s.date_type == date_type)
                    .map(|s| &s.stats),
            );
            IntervalSummary {
                geo_type: GeoType::Country,
                name: country.to_string(),
                date_type,
                stats,
            }
        })
        .collect()
}
