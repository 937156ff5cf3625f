//! Daily partitions of the event log and the reconciliation diff.
//!
//! A partition covers one calendar day and is named
//! `{base_table}__{yyyy_mm_dd}`. The reconciler compares the partitions that
//! exist against the desired rolling window and creates or drops the
//! difference. Everything here is pure; the DDL lives in
//! [`crate::storage::partitions`].

use std::{collections::BTreeSet, fmt};

use chrono::{Days, NaiveDate};

use crate::error::{CoreError, Result};

/// Separator between the base table name and the date suffix.
pub const PARTITION_SEPARATOR: &str = "__";

const DATE_SUFFIX_FORMAT: &str = "%Y_%m_%d";

/// Smallest number of days kept on either side of today.
pub const MIN_PARTITION_DAYS: u32 = 2;

/// One day-bounded partition of a range-partitioned table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DailyPartitionTable {
    base_table: String,
    day: NaiveDate,
}

impl DailyPartitionTable {
    /// Creates the partition of `base_table` for `day`.
    pub fn new(base_table: impl Into<String>, day: NaiveDate) -> Self {
        Self { base_table: base_table.into(), day }
    }

    /// Parses a physical partition name such as `webhook_events__2020_01_01`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidPartitionName` unless the name splits into
    /// exactly a base table and a valid calendar date.
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidPartitionName(name.to_string());

        let parts: Vec<&str> = name.split(PARTITION_SEPARATOR).collect();
        let [base_table, suffix] = parts.as_slice() else {
            return Err(invalid());
        };
        if base_table.is_empty() {
            return Err(invalid());
        }
        let day = NaiveDate::parse_from_str(suffix, DATE_SUFFIX_FORMAT).map_err(|_| invalid())?;

        // chrono accepts unpadded fields; only the canonical name is a partition.
        let table = Self::new(*base_table, day);
        if table.partition_name() != name {
            return Err(invalid());
        }

        Ok(table)
    }

    /// Name of the parent table.
    pub fn base_table(&self) -> &str {
        &self.base_table
    }

    /// Day covered by the partition.
    pub fn day(&self) -> NaiveDate {
        self.day
    }

    /// Physical table name of the partition.
    pub fn partition_name(&self) -> String {
        format!("{}{PARTITION_SEPARATOR}{}", self.base_table, self.day.format(DATE_SUFFIX_FORMAT))
    }

    /// Inclusive lower bound of the partition range, as an ISO date.
    pub fn range_from(&self) -> String {
        self.day.format("%Y-%m-%d").to_string()
    }

    /// Exclusive upper bound of the partition range, as an ISO date.
    pub fn range_to(&self) -> String {
        self.day.checked_add_days(Days::new(1)).unwrap_or(self.day).format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for DailyPartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.partition_name())
    }
}

/// Difference between an observed and a desired set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReconciliationSet<T: Ord> {
    /// Members of the desired set missing from the current set.
    pub to_add: BTreeSet<T>,
    /// Members of the current set absent from the desired set.
    pub to_remove: BTreeSet<T>,
}

impl<T: Ord + Clone> StateReconciliationSet<T> {
    /// Computes `desired - current` and `current - desired`.
    pub fn make(current: &BTreeSet<T>, desired: &BTreeSet<T>) -> Self {
        Self {
            to_add: desired.difference(current).cloned().collect(),
            to_remove: current.difference(desired).cloned().collect(),
        }
    }

    /// Whether nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Dates that should have a partition on `today`.
///
/// Returns `[today - past, today) ∪ [today, today + future)`, with both
/// counts raised to at least [`MIN_PARTITION_DAYS`].
pub fn compute_desired_partitions_state(
    today: NaiveDate,
    past_count: u32,
    future_count: u32,
) -> BTreeSet<NaiveDate> {
    let past = i64::from(past_count.max(MIN_PARTITION_DAYS));
    let future = i64::from(future_count.max(MIN_PARTITION_DAYS));

    (-past..future)
        .filter_map(|offset| today.checked_add_signed(chrono::Duration::days(offset)))
        .collect()
}

/// Desired partitions of `base_table` on `today`.
pub fn desired_partitions(
    base_table: &str,
    today: NaiveDate,
    past_count: u32,
    future_count: u32,
) -> BTreeSet<DailyPartitionTable> {
    compute_desired_partitions_state(today, past_count, future_count)
        .into_iter()
        .map(|day| DailyPartitionTable::new(base_table, day))
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parse_round_trips_partition_name() {
        let table = DailyPartitionTable::parse("table__2020_01_01").unwrap();

        assert_eq!(table, DailyPartitionTable::new("table", date(2020, 1, 1)));
        assert_eq!(table.partition_name(), "table__2020_01_01");
    }

    #[test]
    fn parse_rejects_malformed_names() {
        for name in [
            "table__2020_13_1",
            "table_2020_01_01",
            "table__2020_01_01__x",
            "table__",
            "__2020_01_01",
            "table__2020_02_30",
            "table__2020_1_1",
            "table__2020_01_1",
            "table__20_01_01",
            "table__+2020_01_01",
        ] {
            assert!(
                matches!(DailyPartitionTable::parse(name), Err(CoreError::InvalidPartitionName(_))),
                "{name} should not parse"
            );
        }
    }

    proptest! {
        #[test]
        fn parse_accepts_exactly_the_canonical_names(days in 0u32..40_000) {
            let day = date(1970, 1, 1) + chrono::Days::new(u64::from(days));
            let name = DailyPartitionTable::new("webhook_events", day).partition_name();

            prop_assert_eq!(DailyPartitionTable::parse(&name).unwrap().day(), day);
        }
    }

    #[test]
    fn range_is_half_open_day() {
        let table = DailyPartitionTable::new("webhook_events", date(2019, 12, 31));
        assert_eq!(table.range_from(), "2019-12-31");
        assert_eq!(table.range_to(), "2020-01-01");
    }

    #[test]
    fn desired_state_spans_past_and_future_window() {
        let desired = compute_desired_partitions_state(date(2020, 1, 1), 7, 7);

        assert_eq!(desired.len(), 14);
        assert_eq!(desired.first(), Some(&date(2019, 12, 25)));
        assert_eq!(desired.last(), Some(&date(2020, 1, 7)));
        assert!(desired.contains(&date(2020, 1, 1)));
    }

    #[test]
    fn desired_state_counts_are_clamped() {
        let desired = compute_desired_partitions_state(date(2020, 1, 1), 0, 1);

        let expected: BTreeSet<_> =
            [date(2019, 12, 30), date(2019, 12, 31), date(2020, 1, 1), date(2020, 1, 2)].into();
        assert_eq!(desired, expected);
    }

    #[test]
    fn reconcile_from_empty_adds_everything() {
        let desired = desired_partitions("t", date(2020, 1, 1), 7, 7);
        let diff = StateReconciliationSet::make(&BTreeSet::new(), &desired);

        assert_eq!(diff.to_add, desired);
        assert!(diff.to_remove.is_empty());
    }

    #[test]
    fn reconcile_after_two_days_rolls_the_window() {
        let current = desired_partitions("t", date(2020, 1, 1), 7, 7);
        let desired = desired_partitions("t", date(2020, 1, 3), 7, 7);

        let diff = StateReconciliationSet::make(&current, &desired);

        let days = |set: &BTreeSet<DailyPartitionTable>| -> Vec<NaiveDate> {
            set.iter().map(DailyPartitionTable::day).collect()
        };
        assert_eq!(days(&diff.to_add), vec![date(2020, 1, 8), date(2020, 1, 9)]);
        assert_eq!(days(&diff.to_remove), vec![date(2019, 12, 25), date(2019, 12, 26)]);
    }

    #[test]
    fn reconcile_same_state_is_empty() {
        let state = desired_partitions("t", date(2021, 6, 15), 3, 3);
        assert!(StateReconciliationSet::make(&state, &state).is_empty());
    }

    proptest! {
        #[test]
        fn applying_diff_reaches_desired_state(
            current in proptest::collection::btree_set(0u8..40, 0..20),
            desired in proptest::collection::btree_set(0u8..40, 0..20),
        ) {
            let diff = StateReconciliationSet::make(&current, &desired);

            let mut applied: BTreeSet<u8> =
                current.difference(&diff.to_remove).copied().collect();
            applied.extend(diff.to_add.iter().copied());

            prop_assert_eq!(&applied, &desired);
            prop_assert!(diff.to_add.is_disjoint(&current));
            prop_assert!(diff.to_remove.is_disjoint(&desired));
        }

        #[test]
        fn desired_state_size_matches_clamped_counts(past in 0u32..30, future in 0u32..30) {
            let desired = compute_desired_partitions_state(date(2022, 3, 1), past, future);
            let expected = past.max(MIN_PARTITION_DAYS) + future.max(MIN_PARTITION_DAYS);
            prop_assert_eq!(desired.len(), expected as usize);
        }
    }
}
