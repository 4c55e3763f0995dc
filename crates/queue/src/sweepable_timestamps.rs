//! Index of fine partitions holding sweep candidates
//!
//! One row per (shard, strategy, coarse partition); one column per fine
//! partition inside it that received at least one write. Finding the next
//! partition to sweep is a single ordered row range scan.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

use tsweep_core::{Cell, ColumnRange, KeyValueService, RangeRequest, Result, ShardAndStrategy, TableRef, WriteInfo};

use crate::encoding::{
    decode_sweepable_timestamps_column, sweepable_timestamps_column, sweepable_timestamps_row,
    sweepable_timestamps_table,
};
use crate::partitioning::{coarse_partition_for_fine, ts_partition_fine};

/// Timestamp queue tables are written and deleted at
pub(crate) const QUEUE_WRITE_TIMESTAMP: i64 = 0;
/// Timestamp queue tables are read at
pub(crate) const QUEUE_READ_TIMESTAMP: i64 = i64::MAX;

const PRESENT: &[u8] = &[1];

/// Store of the sweepable timestamps index
pub struct SweepableTimestamps {
    kvs: Arc<dyn KeyValueService>,
    table: TableRef,
}

impl SweepableTimestamps {
    /// Index backed by `kvs`
    pub fn new(kvs: Arc<dyn KeyValueService>) -> Self {
        Self {
            kvs,
            table: sweepable_timestamps_table(),
        }
    }

    /// Record the fine partitions of `writes` as holding candidates for `ss`
    pub fn enqueue(&self, ss: ShardAndStrategy, writes: &[WriteInfo]) -> Result<()> {
        let fines: BTreeSet<i64> = writes.iter().map(|w| ts_partition_fine(w.timestamp)).collect();
        let values: BTreeMap<Cell, Vec<u8>> = fines
            .into_iter()
            .map(|fine| {
                let cell = Cell::new(
                    sweepable_timestamps_row(ss, coarse_partition_for_fine(fine)),
                    sweepable_timestamps_column(fine),
                );
                (cell, PRESENT.to_vec())
            })
            .collect();
        if values.is_empty() {
            return Ok(());
        }
        self.kvs.put(&self.table, &values, QUEUE_WRITE_TIMESTAMP)
    }

    /// Lowest fine partition holding candidates for `ss` in
    /// `[fine(last_swept + 1), fine(sweep_ts - 1)]`
    pub fn next_sweepable_timestamp_partition(
        &self,
        ss: ShardAndStrategy,
        last_swept: i64,
        sweep_ts: i64,
    ) -> Result<Option<i64>> {
        let min_fine = ts_partition_fine(last_swept.saturating_add(1));
        let max_fine = ts_partition_fine(sweep_ts.saturating_sub(1));
        if min_fine > max_fine {
            return Ok(None);
        }

        let range = RangeRequest::rows(
            sweepable_timestamps_row(ss, coarse_partition_for_fine(min_fine)),
            sweepable_timestamps_row(ss, coarse_partition_for_fine(max_fine).saturating_add(1)),
        )
        .with_columns(ColumnRange {
            start: Some(sweepable_timestamps_column(min_fine)),
            end: None,
        });

        for (cell, _) in self.kvs.get_range(&self.table, &range, QUEUE_READ_TIMESTAMP)? {
            let fine = decode_sweepable_timestamps_column(cell.column())?;
            if fine > max_fine {
                break;
            }
            if fine >= min_fine {
                trace!(target: "tsweep::queue", %ss, fine, "Found sweepable partition");
                return Ok(Some(fine));
            }
        }
        Ok(None)
    }

    /// Remove the index entries of fine partitions `[from_fine, to_fine)`
    ///
    /// Whole coarse rows inside the range are dropped in one range delete;
    /// the columns of the partially covered rows at either end are deleted
    /// individually.
    pub fn clean(&self, ss: ShardAndStrategy, from_fine: i64, to_fine: i64) -> Result<()> {
        if from_fine >= to_fine {
            return Ok(());
        }
        let first_coarse = coarse_partition_for_fine(from_fine);
        let last_coarse = coarse_partition_for_fine(to_fine - 1);

        let mut doomed = BTreeMap::new();
        for coarse in [first_coarse, last_coarse] {
            let row = sweepable_timestamps_row(ss, coarse);
            let columns = ColumnRange::between(
                sweepable_timestamps_column(from_fine),
                sweepable_timestamps_column(to_fine),
            );
            for (cell, _) in self
                .kvs
                .get_row_column_range(&self.table, &row, &columns, QUEUE_READ_TIMESTAMP, None)?
            {
                doomed.insert(cell, [QUEUE_WRITE_TIMESTAMP].into_iter().collect::<BTreeSet<i64>>());
            }
        }
        if !doomed.is_empty() {
            self.kvs.delete(&self.table, &doomed)?;
        }

        if last_coarse > first_coarse.saturating_add(1) {
            let interior = RangeRequest::rows(
                sweepable_timestamps_row(ss, first_coarse + 1),
                sweepable_timestamps_row(ss, last_coarse),
            );
            self.kvs.delete_range(&self.table, &interior)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::{TS_COARSE_GRANULARITY, TS_FINE_GRANULARITY};
    use tsweep_storage::InMemoryKeyValueService;

    fn write_at(ts: i64) -> WriteInfo {
        WriteInfo::write(TableRef::new("ns.t"), Cell::new(b"r".to_vec(), b"c".to_vec()), ts)
    }

    fn index() -> (Arc<InMemoryKeyValueService>, SweepableTimestamps) {
        let kvs = Arc::new(InMemoryKeyValueService::new());
        let index = SweepableTimestamps::new(kvs.clone());
        (kvs, index)
    }

    const SS: ShardAndStrategy = ShardAndStrategy {
        shard: 0,
        strategy: tsweep_core::SweepStrategy::Conservative,
    };

    #[test]
    fn test_empty_index_has_no_partition() {
        let (_, index) = index();
        assert_eq!(index.next_sweepable_timestamp_partition(SS, -1, 1_000).unwrap(), None);
    }

    #[test]
    fn test_returns_lowest_partition_above_progress() {
        let (_, index) = index();
        index
            .enqueue(SS, &[write_at(100), write_at(3 * TS_FINE_GRANULARITY + 5), write_at(TS_COARSE_GRANULARITY + 1)])
            .unwrap();

        assert_eq!(index.next_sweepable_timestamp_partition(SS, -1, i64::MAX).unwrap(), Some(0));
        assert_eq!(
            index.next_sweepable_timestamp_partition(SS, TS_FINE_GRANULARITY - 1, i64::MAX).unwrap(),
            Some(3)
        );
        assert_eq!(
            index.next_sweepable_timestamp_partition(SS, 4 * TS_FINE_GRANULARITY, i64::MAX).unwrap(),
            Some(TS_COARSE_GRANULARITY / TS_FINE_GRANULARITY)
        );
    }

    #[test]
    fn test_partition_beyond_sweep_ts_is_not_returned() {
        let (_, index) = index();
        index.enqueue(SS, &[write_at(2 * TS_FINE_GRANULARITY)]).unwrap();

        assert_eq!(
            index.next_sweepable_timestamp_partition(SS, -1, 2 * TS_FINE_GRANULARITY).unwrap(),
            None
        );
        assert_eq!(
            index.next_sweepable_timestamp_partition(SS, -1, 2 * TS_FINE_GRANULARITY + 1).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn test_other_queue_is_invisible() {
        let (_, index) = index();
        index.enqueue(ShardAndStrategy::thorough(0), &[write_at(10)]).unwrap();
        index.enqueue(ShardAndStrategy::conservative(1), &[write_at(10)]).unwrap();
        assert_eq!(index.next_sweepable_timestamp_partition(SS, -1, 1_000).unwrap(), None);
    }

    #[test]
    fn test_clean_removes_swept_partitions_only() {
        let (kvs, index) = index();
        let far = 2 * TS_COARSE_GRANULARITY + 7;
        index
            .enqueue(SS, &[write_at(1), write_at(TS_FINE_GRANULARITY + 1), write_at(TS_COARSE_GRANULARITY), write_at(far)])
            .unwrap();

        index.clean(SS, 0, ts_partition_fine(far)).unwrap();
        assert_eq!(
            index.next_sweepable_timestamp_partition(SS, -1, i64::MAX).unwrap(),
            Some(ts_partition_fine(far))
        );
        assert_eq!(kvs.cell_count(&sweepable_timestamps_table()), 1);
    }
}
