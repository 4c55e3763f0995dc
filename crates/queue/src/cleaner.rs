//! Prunes consumed queue entries and persists progress

use std::sync::Arc;
use tracing::trace;

use tsweep_core::{Result, ShardAndStrategy};

use crate::batch::DedicatedRows;
use crate::partitioning::ts_partition_fine;
use crate::progress::ShardProgress;
use crate::sweepable_cells::SweepableCells;
use crate::sweepable_timestamps::SweepableTimestamps;

/// Deletes queue rows behind the progress cursor, then moves the cursor
pub struct SweepCleaner {
    cells: Arc<SweepableCells>,
    timestamps: Arc<SweepableTimestamps>,
    progress: Arc<ShardProgress>,
}

impl SweepCleaner {
    /// Cleaner over the given queue stores
    pub fn new(
        cells: Arc<SweepableCells>,
        timestamps: Arc<SweepableTimestamps>,
        progress: Arc<ShardProgress>,
    ) -> Self {
        Self {
            cells,
            timestamps,
            progress,
        }
    }

    /// Account for a pass over `ss` that moved progress from `old_progress` to `new_progress`
    ///
    /// Fine partitions whose every timestamp is at or below `new_progress`
    /// are dropped from both queue tables, as are the dedicated rows of
    /// start timestamps resolved by the pass. Progress is persisted last,
    /// so a failed clean is simply repeated by the next pass.
    pub fn clean(
        &self,
        ss: ShardAndStrategy,
        old_progress: i64,
        new_progress: i64,
        dedicated_rows: &[DedicatedRows],
    ) -> Result<()> {
        for rows in dedicated_rows {
            self.cells.delete_dedicated_rows(ss, *rows)?;
        }

        if new_progress > old_progress {
            let from_fine = ts_partition_fine(old_progress.saturating_add(1));
            let to_fine = ts_partition_fine(new_progress.saturating_add(1));
            if from_fine < to_fine {
                trace!(target: "tsweep::queue", %ss, from_fine, to_fine, "Cleaning swept partitions");
                self.cells.clean(ss, from_fine, to_fine)?;
                self.timestamps.clean(ss, from_fine, to_fine)?;
            }
        }

        self.progress.update_last_swept_timestamp(ss, new_progress)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_ts_cache::CommitTsCache;
    use crate::encoding::{sweepable_cells_table, sweepable_timestamps_table};
    use crate::partitioning::{max_ts_for_fine_partition, INITIAL_TIMESTAMP};
    use tsweep_concurrency::InMemoryTransactionService;
    use tsweep_core::{Cell, TableRef, WriteInfo};
    use tsweep_storage::InMemoryKeyValueService;

    struct Fixture {
        kvs: Arc<InMemoryKeyValueService>,
        cells: Arc<SweepableCells>,
        timestamps: Arc<SweepableTimestamps>,
        progress: Arc<ShardProgress>,
        cleaner: SweepCleaner,
    }

    fn fixture() -> Fixture {
        let kvs = Arc::new(InMemoryKeyValueService::new());
        let cache = Arc::new(CommitTsCache::new(Arc::new(InMemoryTransactionService::new())));
        let cells = Arc::new(SweepableCells::new(kvs.clone(), cache));
        let timestamps = Arc::new(SweepableTimestamps::new(kvs.clone()));
        let progress = Arc::new(ShardProgress::new(kvs.clone()));
        let cleaner = SweepCleaner::new(cells.clone(), timestamps.clone(), progress.clone());
        Fixture {
            kvs,
            cells,
            timestamps,
            progress,
            cleaner,
        }
    }

    fn enqueue(f: &Fixture, ss: ShardAndStrategy, ts: i64) {
        let writes = [WriteInfo::write(TableRef::new("ns.t"), Cell::new(b"r".to_vec(), b"c".to_vec()), ts)];
        f.cells.enqueue(ss, &writes).unwrap();
        f.timestamps.enqueue(ss, &writes).unwrap();
    }

    #[test]
    fn test_fully_swept_partition_is_removed() {
        let f = fixture();
        let ss = ShardAndStrategy::conservative(0);
        enqueue(&f, ss, 10);
        enqueue(&f, ss, 60_000);

        f.cleaner.clean(ss, INITIAL_TIMESTAMP, max_ts_for_fine_partition(0), &[]).unwrap();

        assert_eq!(f.progress.get_last_swept_timestamp(ss).unwrap(), 49_999);
        assert_eq!(f.kvs.cell_count(&sweepable_cells_table()), 1);
        assert_eq!(f.kvs.cell_count(&sweepable_timestamps_table()), 1);
        assert_eq!(
            f.timestamps.next_sweepable_timestamp_partition(ss, INITIAL_TIMESTAMP, i64::MAX).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_partially_swept_partition_is_kept() {
        let f = fixture();
        let ss = ShardAndStrategy::thorough(0);
        enqueue(&f, ss, 10);
        enqueue(&f, ss, 20);

        f.cleaner.clean(ss, INITIAL_TIMESTAMP, 15, &[]).unwrap();

        assert_eq!(f.progress.get_last_swept_timestamp(ss).unwrap(), 15);
        assert_eq!(f.kvs.cell_count(&sweepable_cells_table()), 2);
    }

    #[test]
    fn test_progress_does_not_regress() {
        let f = fixture();
        let ss = ShardAndStrategy::conservative(0);
        f.cleaner.clean(ss, INITIAL_TIMESTAMP, 100, &[]).unwrap();
        f.cleaner.clean(ss, 100, 50, &[]).unwrap();
        assert_eq!(f.progress.get_last_swept_timestamp(ss).unwrap(), 100);
    }
}
