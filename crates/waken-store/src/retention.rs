//! Checkpoint retention policy.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::CheckpointId;

/// Default number of most-recent checkpoints always kept.
pub const DEFAULT_MAX_COUNT: usize = 10;

/// Default age window, in days, for the one-per-day rule.
pub const DEFAULT_MAX_AGE_DAYS: u32 = 7;

/// Which complete checkpoints survive a prune.
///
/// A checkpoint is kept if it is among the `max_count` most recent, or if it
/// is the most recent one of its UTC calendar day and that day is within
/// `max_age_days` of now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
        }
    }
}

impl RetentionPolicy {
    /// Ids to keep among `complete` (id, creation time) pairs.
    pub fn retained(
        &self,
        complete: &[(CheckpointId, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> BTreeSet<CheckpointId> {
        let mut sorted: Vec<_> = complete.iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        let mut keep: BTreeSet<CheckpointId> = sorted
            .iter()
            .take(self.max_count)
            .map(|(id, _)| id.clone())
            .collect();

        // A window reaching past the earliest representable time has no horizon.
        let horizon = Duration::try_days(i64::from(self.max_age_days))
            .and_then(|window| now.checked_sub_signed(window));
        let mut newest_per_day: BTreeMap<NaiveDate, &CheckpointId> = BTreeMap::new();
        for (id, created_at) in &sorted {
            if horizon.is_some_and(|horizon| *created_at < horizon) {
                continue;
            }
            // Sorted newest first, so the first one seen per day wins.
            newest_per_day.entry(created_at.date_naive()).or_insert(id);
        }
        keep.extend(newest_per_day.into_values().cloned());
        keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn entries(times: &[DateTime<Utc>]) -> Vec<(CheckpointId, DateTime<Utc>)> {
        times
            .iter()
            .map(|t| (CheckpointId::from_datetime(*t), *t))
            .collect()
    }

    #[test]
    fn test_keeps_most_recent_n() {
        let policy = RetentionPolicy {
            max_count: 2,
            max_age_days: 0,
        };
        let list = entries(&[at(1, 1), at(1, 2), at(1, 3), at(1, 4)]);
        let keep = policy.retained(&list, at(10, 0));

        assert_eq!(keep.len(), 2);
        assert!(keep.contains(&list[3].0));
        assert!(keep.contains(&list[2].0));
    }

    #[test]
    fn test_keeps_newest_per_day_within_window() {
        let policy = RetentionPolicy {
            max_count: 1,
            max_age_days: 4,
        };
        let list = entries(&[at(5, 1), at(5, 9), at(7, 3), at(7, 8), at(8, 2), at(1, 1)]);
        let keep = policy.retained(&list, at(8, 12));

        let expected: BTreeSet<_> = [&list[1], &list[3], &list[4]]
            .into_iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(keep, expected);
    }

    #[test]
    fn test_huge_age_window_keeps_one_per_day() {
        let policy = RetentionPolicy {
            max_count: 1,
            max_age_days: u32::MAX,
        };
        let list = entries(&[at(1, 1), at(1, 2), at(2, 1), at(3, 1)]);
        let keep = policy.retained(&list, at(10, 0));

        let expected: BTreeSet<_> = [&list[1], &list[2], &list[3]]
            .into_iter()
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(keep, expected);
    }

    #[test]
    fn test_empty_input() {
        assert!(
            RetentionPolicy::default()
                .retained(&[], Utc::now())
                .is_empty()
        );
    }

    proptest! {
        #[test]
        fn retained_always_includes_newest(
            hours in prop::collection::btree_set(0u32..24 * 20, 1..40),
            max_count in 1usize..5,
            max_age_days in 0u32..10,
        ) {
            let base = at(1, 0);
            let times: Vec<_> = hours.iter().map(|h| base + Duration::hours(i64::from(*h))).collect();
            let list = entries(&times);
            let policy = RetentionPolicy { max_count, max_age_days };
            let keep = policy.retained(&list, base + Duration::days(21));

            let newest = list.iter().max_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0))).unwrap();
            prop_assert!(keep.contains(&newest.0));
            prop_assert!(keep.len() >= max_count.min(list.len()));
            prop_assert!(keep.iter().all(|id| list.iter().any(|(l, _)| l == id)));
        }
    }
}
