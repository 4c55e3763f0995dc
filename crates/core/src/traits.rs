//! Collaborator traits
//!
//! The sweep engine owns no storage or coordination of its own. Everything it
//! touches is reached through these traits so in-memory, remote or spying
//! implementations can be swapped in without changing the engine.
//!
//! Thread safety: all implementations must be safe to call concurrently from
//! multiple threads (requires Send + Sync).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::Result;
use crate::lock_types::{LockRequest, LockToken};
use crate::sweep_types::CommitStatus;
use crate::types::{Cell, CheckAndSetRequest, ColumnRange, RangeRequest, TableMetadata, TableRef, Value};

/// Multi-version key-value store
///
/// Every put lands at an explicit timestamp. A read at timestamp `t` observes
/// the newest version strictly below `t`.
pub trait KeyValueService: Send + Sync {
    /// Whether the store is ready to serve requests
    fn is_initialized(&self) -> bool;

    /// Create a table (idempotent) and record its metadata
    fn create_table(&self, table: &TableRef, metadata: TableMetadata) -> Result<()>;

    /// Metadata recorded for a table, `None` if the table is unknown
    fn get_metadata_for_table(&self, table: &TableRef) -> Result<Option<TableMetadata>>;

    /// Write every cell in `values` at `timestamp`
    fn put(&self, table: &TableRef, values: &BTreeMap<Cell, Vec<u8>>, timestamp: i64) -> Result<()>;

    /// Write every cell at timestamp 0, failing if any of them already has a value
    fn put_unless_exists(&self, table: &TableRef, values: &BTreeMap<Cell, Vec<u8>>) -> Result<()>;

    /// Conditionally replace a single cell's value at timestamp 0
    fn check_and_set(&self, request: &CheckAndSetRequest) -> Result<()>;

    /// For each cell, the newest version strictly below the given timestamp
    ///
    /// Cells with no such version are absent from the result.
    fn get(&self, table: &TableRef, timestamp_by_cell: &BTreeMap<Cell, i64>) -> Result<BTreeMap<Cell, Value>>;

    /// Columns of one row in column order, newest version strictly below `timestamp`
    ///
    /// With `max_cells` set, at most that many of the first matching cells are returned.
    fn get_row_column_range(
        &self,
        table: &TableRef,
        row: &[u8],
        columns: &ColumnRange,
        timestamp: i64,
        max_cells: Option<usize>,
    ) -> Result<Vec<(Cell, Value)>>;

    /// Cells of a row range in (row, column) order, newest version strictly below `timestamp`
    fn get_range(&self, table: &TableRef, range: &RangeRequest, timestamp: i64) -> Result<Vec<(Cell, Value)>>;

    /// Delete exactly the listed versions
    fn delete(&self, table: &TableRef, versions: &BTreeMap<Cell, BTreeSet<i64>>) -> Result<()>;

    /// Delete every version of every cell in the listed rows
    fn delete_rows(&self, table: &TableRef, rows: &[Vec<u8>]) -> Result<()>;

    /// Delete every version of every cell in the row range
    fn delete_range(&self, table: &TableRef, range: &RangeRequest) -> Result<()>;

    /// For each cell, delete every version below the given exclusive bound
    ///
    /// The sentinel at timestamp -1 survives unless `include_sentinels` is set.
    fn delete_all_timestamps(
        &self,
        table: &TableRef,
        max_timestamp_exclusive_by_cell: &BTreeMap<Cell, i64>,
        include_sentinels: bool,
    ) -> Result<()>;

    /// Write an empty value at timestamp -1 for each cell
    fn add_garbage_collection_sentinel_values(&self, table: &TableRef, cells: &BTreeSet<Cell>) -> Result<()>;
}

/// Maps start timestamps to commit outcomes
pub trait TransactionService: Send + Sync {
    /// Outcome for `start_ts`; `None` while unknown or in flight
    fn get(&self, start_ts: i64) -> Result<Option<CommitStatus>>;

    /// Outcomes for many start timestamps; unknown ones are absent
    fn get_many(&self, start_timestamps: &BTreeSet<i64>) -> Result<HashMap<i64, CommitStatus>> {
        let mut result = HashMap::with_capacity(start_timestamps.len());
        for &start_ts in start_timestamps {
            if let Some(status) = self.get(start_ts)? {
                result.insert(start_ts, status);
            }
        }
        Ok(result)
    }

    /// Record an outcome, failing with `KeyAlreadyExists` if one is recorded
    fn put_unless_exists(&self, start_ts: i64, status: CommitStatus) -> Result<()>;
}

/// Timestamp boundaries the sweep may not cross
pub trait TimestampsSupplier: Send + Sync {
    /// No transaction still reads below this timestamp
    fn immutable_timestamp(&self) -> Result<i64>;

    /// No read is ever served below this timestamp
    fn unreadable_timestamp(&self) -> Result<i64>;
}

/// Lease-based lock service
pub trait TimelockService: Send + Sync {
    /// Wall clock time of the lock service
    fn current_time_millis(&self) -> Result<i64>;

    /// Try to take every lock in the request; `None` if they are held elsewhere
    fn lock(&self, request: &LockRequest) -> Result<Option<LockToken>>;

    /// Release leases; returns the tokens that were actually held
    fn unlock(&self, tokens: &HashSet<LockToken>) -> Result<HashSet<LockToken>>;

    /// Extend leases; returns the tokens that are still valid
    fn refresh_lock_leases(&self, tokens: &HashSet<LockToken>) -> Result<HashSet<LockToken>>;
}

/// Callback run after cells were physically cleaned
///
/// Invoked once per table per sweep batch, after deletes are applied.
pub trait TargetedSweepFollower: Send + Sync {
    /// Cells of `table` touched by the last batch
    fn run(&self, table: &TableRef, cells: &BTreeSet<Cell>);
}

/// Follower that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpFollower;

impl TargetedSweepFollower for NoOpFollower {
    fn run(&self, _table: &TableRef, _cells: &BTreeSet<Cell>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    // Only implements the required methods, to exercise the default `get_many`.
    struct TxnMap(Mutex<HashMap<i64, CommitStatus>>);

    impl TransactionService for TxnMap {
        fn get(&self, start_ts: i64) -> Result<Option<CommitStatus>> {
            Ok(self.0.lock().get(&start_ts).copied())
        }

        fn put_unless_exists(&self, start_ts: i64, status: CommitStatus) -> Result<()> {
            self.0.lock().entry(start_ts).or_insert(status);
            Ok(())
        }
    }

    #[test]
    fn test_get_many_skips_unknown() {
        let service = TxnMap(Default::default());
        service.put_unless_exists(1, CommitStatus::Committed(2)).unwrap();
        service.put_unless_exists(3, CommitStatus::Aborted).unwrap();

        let result = service.get_many(&[1, 2, 3].into_iter().collect()).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[&1], CommitStatus::Committed(2));
        assert_eq!(result[&3], CommitStatus::Aborted);
    }
}
