//! Removal of duplicate trip submissions.
//!
//! Ingestion can store the same trip several times. Two records are
//! duplicates when they share `(user_id, start_date)`; the first one in
//! arrival order survives and every later one is dropped. Records missing
//! either field are kept and never match anything.

use crate::error::{EngineError, Result};
use crate::models::{LegDetail, TripRecord};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

/// Access to the duplicate key of a trip-like record.
pub trait TripKey {
    fn user_id(&self) -> Option<&str>;
    fn start_date(&self) -> Option<DateTime<Utc>>;

    /// `(user_id, start millis)` when both are present.
    fn dedup_key(&self) -> Option<(String, i64)> {
        match (self.user_id(), self.start_date()) {
            (Some(user), Some(start)) => Some((user.to_string(), start.timestamp_millis())),
            _ => None,
        }
    }
}

impl TripKey for TripRecord {
    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }
}

impl TripKey for LegDetail {
    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }
}

/// Positions of records that repeat an earlier key.
fn duplicate_positions<T: TripKey>(records: &[T]) -> Vec<bool> {
    let mut seen = HashSet::new();
    records
        .iter()
        .map(|record| match record.dedup_key() {
            Some(key) => !seen.insert(key),
            None => false,
        })
        .collect()
}

/// Drop every record whose key was already seen, keeping relative order.
///
/// Returns the number of records removed.
pub fn dedup_in_place<T: TripKey>(records: &mut Vec<T>) -> usize {
    let duplicate = duplicate_positions(records);
    let before = records.len();
    let mut flags = duplicate.into_iter();
    records.retain(|_| !flags.next().unwrap_or(false));

    let removed = before - records.len();
    if removed > 0 {
        debug!(removed, kept = records.len(), "dropped duplicate trips");
    }
    removed
}

/// Deduplicate `primary` and remove the same positions from `secondary`.
///
/// The lists must be positionally aligned; mismatched lengths are rejected
/// before anything is removed.
pub fn dedup_parallel<T: TripKey, U>(primary: &mut Vec<T>, secondary: &mut Vec<U>) -> Result<usize> {
    if primary.len() != secondary.len() {
        return Err(EngineError::InvalidInput(format!(
            "parallel lists differ in length: {} vs {}",
            primary.len(),
            secondary.len()
        )));
    }

    let duplicate = duplicate_positions(primary);

    let mut flags = duplicate.iter();
    primary.retain(|_| !flags.next().copied().unwrap_or(false));
    let mut flags = duplicate.iter();
    secondary.retain(|_| !flags.next().copied().unwrap_or(false));

    Ok(duplicate.iter().filter(|d| **d).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn trip(id: &str, user: &str, start: i64) -> TripRecord {
        TripRecord::new(id, user, ts(start))
    }

    fn ids(trips: &[TripRecord]) -> Vec<&str> {
        trips.iter().map(|t| t.trip_id.as_str()).collect()
    }

    #[test]
    fn test_first_occurrence_wins() {
        let mut trips = vec![trip("a", "u1", 100), trip("b", "u1", 100), trip("c", "u1", 200)];
        let removed = dedup_in_place(&mut trips);
        assert_eq!(removed, 1);
        assert_eq!(ids(&trips), vec!["a", "c"]);
    }

    #[test]
    fn test_same_start_different_users_kept() {
        let mut trips = vec![trip("a", "u1", 100), trip("b", "u2", 100)];
        assert_eq!(dedup_in_place(&mut trips), 0);
        assert_eq!(trips.len(), 2);
    }

    #[test]
    fn test_missing_fields_never_match() {
        let mut no_user = trip("b", "u1", 100);
        no_user.user_id = None;
        let mut no_start = trip("c", "u1", 100);
        no_start.start_date = None;
        let mut trips = vec![trip("a", "u1", 100), no_user.clone(), no_start.clone(), no_user];

        assert_eq!(dedup_in_place(&mut trips), 0);
        assert_eq!(ids(&trips), vec!["a", "b", "c", "b"]);
    }

    #[test]
    fn test_order_preserved_across_many_duplicates() {
        let mut trips = vec![
            trip("a", "u1", 300),
            trip("b", "u2", 100),
            trip("c", "u1", 300),
            trip("d", "u2", 200),
            trip("e", "u2", 100),
        ];
        assert_eq!(dedup_in_place(&mut trips), 2);
        assert_eq!(ids(&trips), vec!["a", "b", "d"]);
    }

    #[test]
    fn test_parallel_removes_same_positions() {
        let mut trips = vec![trip("a", "u1", 100), trip("b", "u1", 100), trip("c", "u1", 200)];
        let mut enriched = vec!["A", "B", "C"];

        let removed = dedup_parallel(&mut trips, &mut enriched).unwrap();

        assert_eq!(removed, 1);
        assert_eq!(ids(&trips), vec!["a", "c"]);
        assert_eq!(enriched, vec!["A", "C"]);
    }

    #[test]
    fn test_parallel_length_mismatch() {
        let mut trips = vec![trip("a", "u1", 100), trip("b", "u1", 100)];
        let mut enriched = vec![1];
        assert!(dedup_parallel(&mut trips, &mut enriched).is_err());
        assert_eq!(trips.len(), 2);
    }

    #[test]
    fn test_legs_use_same_key() {
        let mut first = LegDetail::new("t1", ts(100), ts(200), 10.0, 1);
        first.user_id = Some("u1".into());
        let mut second = first.clone();
        second.trip_id = "t2".into();

        let mut legs = vec![first, second];
        assert_eq!(dedup_in_place(&mut legs), 1);
        assert_eq!(legs[0].trip_id, "t1");
    }
}
