//! Sweep queue types
//!
//! - `SweepStrategy`: conservative (leaves sentinels) or thorough
//! - `ShardAndStrategy`: one independently swept queue partition
//! - `WriteReference` / `WriteInfo`: a candidate version awaiting sweep
//! - `CommitStatus`: transaction table answer for a start timestamp

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

use crate::types::{Cell, TableRef, TableSweepStrategy};

/// Strategy a shard is swept with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SweepStrategy {
    /// Leaves a sentinel when history below the newest swept version is removed.
    /// Swept up to the immutable timestamp.
    Conservative,
    /// Never writes sentinels and removes existing ones and latest tombstones.
    /// Swept up to the unreadable timestamp.
    Thorough,
}

impl SweepStrategy {
    /// Both strategies, conservative first
    pub const ALL: [SweepStrategy; 2] = [SweepStrategy::Conservative, SweepStrategy::Thorough];

    /// Whether swept cells must keep a sentinel
    pub fn should_add_sentinels(self) -> bool {
        matches!(self, SweepStrategy::Conservative)
    }

    /// Whether a tombstone that is the newest swept version is itself deleted
    pub fn should_sweep_last_committed_tombstone(self) -> bool {
        matches!(self, SweepStrategy::Thorough)
    }

    /// Stable single-byte tag used in persisted keys
    pub fn as_byte(self) -> u8 {
        match self {
            SweepStrategy::Conservative => 0,
            SweepStrategy::Thorough => 1,
        }
    }

    /// Inverse of [`SweepStrategy::as_byte`]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SweepStrategy::Conservative),
            1 => Some(SweepStrategy::Thorough),
            _ => None,
        }
    }

    /// Sweep strategy for a table, or `None` if the table is never swept
    pub fn for_table(strategy: TableSweepStrategy) -> Option<Self> {
        match strategy {
            TableSweepStrategy::Nothing => None,
            TableSweepStrategy::Conservative => Some(SweepStrategy::Conservative),
            TableSweepStrategy::Thorough => Some(SweepStrategy::Thorough),
        }
    }
}

impl fmt::Display for SweepStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepStrategy::Conservative => f.write_str("CONSERVATIVE"),
            SweepStrategy::Thorough => f.write_str("THOROUGH"),
        }
    }
}

/// Identifies one independently swept queue partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardAndStrategy {
    /// Shard number in `[0, number_of_shards)`
    pub shard: u32,
    /// Strategy this queue is swept with
    pub strategy: SweepStrategy,
}

impl ShardAndStrategy {
    /// Create a pair
    pub fn new(shard: u32, strategy: SweepStrategy) -> Self {
        Self { shard, strategy }
    }

    /// Conservative queue for `shard`
    pub fn conservative(shard: u32) -> Self {
        Self::new(shard, SweepStrategy::Conservative)
    }

    /// Thorough queue for `shard`
    pub fn thorough(shard: u32) -> Self {
        Self::new(shard, SweepStrategy::Thorough)
    }

    /// Whether this is a conservative queue
    pub fn is_conservative(&self) -> bool {
        self.strategy == SweepStrategy::Conservative
    }

    /// Text used as the lock descriptor for leasing this pair
    pub fn to_text(&self) -> String {
        format!("shard {} and strategy {}", self.shard, self.strategy)
    }
}

impl fmt::Display for ShardAndStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Which cell a write went to and whether it was a deletion
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteReference {
    /// Table written to
    pub table: TableRef,
    /// Cell written to
    pub cell: Cell,
    /// True if the write stored an empty value
    pub is_tombstone: bool,
}

/// A candidate version: a write to a cell at a start timestamp
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteInfo {
    /// Where the write went
    pub write_ref: WriteReference,
    /// Start timestamp of the writing transaction
    pub timestamp: i64,
}

impl WriteInfo {
    /// A value write
    pub fn write(table: TableRef, cell: Cell, timestamp: i64) -> Self {
        Self {
            write_ref: WriteReference {
                table,
                cell,
                is_tombstone: false,
            },
            timestamp,
        }
    }

    /// A tombstone write
    pub fn tombstone(table: TableRef, cell: Cell, timestamp: i64) -> Self {
        Self {
            write_ref: WriteReference {
                table,
                cell,
                is_tombstone: true,
            },
            timestamp,
        }
    }

    /// Table written to
    pub fn table(&self) -> &TableRef {
        &self.write_ref.table
    }

    /// Cell written to
    pub fn cell(&self) -> &Cell {
        &self.write_ref.cell
    }

    /// Whether the write was a tombstone
    pub fn is_tombstone(&self) -> bool {
        self.write_ref.is_tombstone
    }

    /// Exclusive upper bound of the versions removed when this write is swept
    ///
    /// Thorough sweep removes a latest tombstone itself; everything else keeps
    /// the swept write and removes the history below it.
    pub fn timestamp_to_delete_at_exclusive(&self, strategy: SweepStrategy) -> i64 {
        if self.is_tombstone() && strategy.should_sweep_last_committed_tombstone() {
            self.timestamp + 1
        } else {
            self.timestamp
        }
    }

    /// Shard this write is placed in when there are `number_of_shards` shards.
    ///
    /// The hash covers the table and cell only, so all versions of a cell land
    /// in the same shard for a given shard count.
    pub fn to_shard(&self, number_of_shards: u32) -> u32 {
        let mut hasher = Xxh3::new();
        for part in [
            self.table().name().as_bytes(),
            self.cell().row(),
            self.cell().column(),
        ] {
            hasher.update(&(part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        (hasher.digest() % u64::from(number_of_shards.max(1))) as u32
    }
}

/// Outcome of a transaction as recorded in the transaction table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitStatus {
    /// Committed at the given commit timestamp
    Committed(i64),
    /// Rolled back; its writes were never visible
    Aborted,
}

/// How a candidate's start timestamp resolves against a sweep timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteClassification {
    /// Committed before the sweep timestamp: history below it may go
    Committed,
    /// Never committed: the write itself is removed
    Aborted,
    /// Committed at/after the sweep timestamp, or status unknown: stop here
    NotYetSweepable,
}

impl WriteClassification {
    /// Classify `status` against an exclusive `sweep_ts`
    pub fn of(status: Option<CommitStatus>, sweep_ts: i64) -> Self {
        match status {
            Some(CommitStatus::Committed(commit_ts)) if commit_ts < sweep_ts => {
                WriteClassification::Committed
            }
            Some(CommitStatus::Aborted) => WriteClassification::Aborted,
            Some(CommitStatus::Committed(_)) | None => WriteClassification::NotYetSweepable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cell(row: &str, col: &str) -> Cell {
        Cell::new(row.as_bytes().to_vec(), col.as_bytes().to_vec())
    }

    #[test]
    fn test_to_text_names_shard_and_strategy() {
        assert_eq!(
            ShardAndStrategy::conservative(3).to_text(),
            "shard 3 and strategy CONSERVATIVE"
        );
        assert_eq!(
            ShardAndStrategy::thorough(0).to_text(),
            "shard 0 and strategy THOROUGH"
        );
    }

    #[test]
    fn test_delete_bound_for_tombstones() {
        let table = TableRef::new("test.table");
        let write = WriteInfo::write(table.clone(), cell("r", "c"), 10);
        let tombstone = WriteInfo::tombstone(table, cell("r", "c"), 10);

        assert_eq!(write.timestamp_to_delete_at_exclusive(SweepStrategy::Conservative), 10);
        assert_eq!(write.timestamp_to_delete_at_exclusive(SweepStrategy::Thorough), 10);
        assert_eq!(tombstone.timestamp_to_delete_at_exclusive(SweepStrategy::Conservative), 10);
        assert_eq!(tombstone.timestamp_to_delete_at_exclusive(SweepStrategy::Thorough), 11);
    }

    #[test]
    fn test_same_cell_same_shard_regardless_of_timestamp() {
        let table = TableRef::new("test.table");
        let a = WriteInfo::write(table.clone(), cell("row", "col"), 1);
        let b = WriteInfo::tombstone(table, cell("row", "col"), 5_000_000);
        assert_eq!(a.to_shard(128), b.to_shard(128));
    }

    #[test]
    fn test_strategy_byte_roundtrip() {
        for strategy in SweepStrategy::ALL {
            assert_eq!(SweepStrategy::from_byte(strategy.as_byte()), Some(strategy));
        }
        assert_eq!(SweepStrategy::from_byte(7), None);
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            WriteClassification::of(Some(CommitStatus::Committed(999)), 1000),
            WriteClassification::Committed
        );
        assert_eq!(
            WriteClassification::of(Some(CommitStatus::Committed(1000)), 1000),
            WriteClassification::NotYetSweepable
        );
        assert_eq!(
            WriteClassification::of(Some(CommitStatus::Aborted), 1000),
            WriteClassification::Aborted
        );
        assert_eq!(
            WriteClassification::of(None, 1000),
            WriteClassification::NotYetSweepable
        );
    }

    proptest! {
        #[test]
        fn prop_shard_is_in_range(row in any::<Vec<u8>>(), col in any::<Vec<u8>>(), shards in 1u32..=256) {
            let write = WriteInfo::write(TableRef::new("t.t"), Cell::new(row, col), 0);
            prop_assert!(write.to_shard(shards) < shards);
        }
    }
}
