//! Sweep batches and their accumulation across fine partitions

use std::collections::BTreeMap;

use tsweep_core::{Cell, TableRef, WriteInfo};

use crate::partitioning::SWEEP_BATCH_SIZE;

/// Dedicated rows of one start timestamp whose writes were fully resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DedicatedRows {
    /// Fine partition the rows belong to
    pub fine_partition: i64,
    /// Start timestamp the rows were written for
    pub start_ts: i64,
}

/// Verified result of reading one fine partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepBatch {
    /// Newest committed write per cell; everything below it may be removed
    pub writes: Vec<WriteInfo>,
    /// Writes of aborted transactions, removed exactly
    pub aborted: Vec<WriteInfo>,
    /// Dedicated rows no longer needed once this batch is applied
    pub dedicated_rows: Vec<DedicatedRows>,
    /// Everything up to and including this timestamp is accounted for
    pub last_swept_timestamp: i64,
    /// Queue entries read, including the one a read stopped on
    pub entries_read: usize,
    /// False when reading stopped at a start timestamp that is not yet sweepable
    pub processed_all: bool,
}

impl SweepBatch {
    /// Batch with nothing to sweep that moves progress to `last_swept_timestamp`
    pub fn empty(last_swept_timestamp: i64) -> Self {
        Self {
            last_swept_timestamp,
            processed_all: true,
            ..Self::default()
        }
    }

    /// Whether applying this batch changes the store
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.aborted.is_empty()
    }
}

/// Merges the batches of consecutive fine partitions into one
///
/// Stops accepting partitions once a read did not process everything, the
/// entry budget is spent, the partition budget is spent or the sweep
/// timestamp is reached.
#[derive(Debug)]
pub struct SweepBatchAccumulator {
    sweep_ts: i64,
    max_partitions: usize,
    progress: i64,
    writes: BTreeMap<(TableRef, Cell), WriteInfo>,
    aborted: Vec<WriteInfo>,
    dedicated_rows: Vec<DedicatedRows>,
    entries_read: usize,
    partitions: usize,
    processed_all: bool,
}

impl SweepBatchAccumulator {
    /// Accumulator for a pass that starts at `progress` and ends below `sweep_ts`
    pub fn new(sweep_ts: i64, progress: i64, max_partitions: usize) -> Self {
        Self {
            sweep_ts,
            max_partitions: max_partitions.max(1),
            progress,
            writes: BTreeMap::new(),
            aborted: Vec::new(),
            dedicated_rows: Vec::new(),
            entries_read: 0,
            partitions: 0,
            processed_all: true,
        }
    }

    /// Exclusive lower bound for the next partition read
    pub fn progress(&self) -> i64 {
        self.progress
    }

    /// Fold in the batch of the next fine partition
    pub fn accumulate(&mut self, batch: SweepBatch) {
        for write in batch.writes {
            let key = (write.table().clone(), write.cell().clone());
            match self.writes.get(&key) {
                Some(existing) if existing.timestamp >= write.timestamp => {}
                _ => {
                    self.writes.insert(key, write);
                }
            }
        }
        self.aborted.extend(batch.aborted);
        self.dedicated_rows.extend(batch.dedicated_rows);
        self.entries_read += batch.entries_read;
        self.partitions += 1;
        self.processed_all = batch.processed_all;
        self.progress = self.progress.max(batch.last_swept_timestamp);
    }

    /// No further partition holds candidates below the sweep timestamp
    pub fn finish_without_candidates(&mut self) {
        if self.processed_all {
            self.progress = self.progress.max(self.sweep_ts.saturating_sub(1));
        }
    }

    /// Whether another partition may be read into this pass
    pub fn should_accept_additional_batch(&self) -> bool {
        self.processed_all
            && self.partitions < self.max_partitions
            && self.entries_read < SWEEP_BATCH_SIZE
            && self.progress < self.sweep_ts.saturating_sub(1)
    }

    /// The merged batch
    pub fn into_batch(self) -> SweepBatch {
        SweepBatch {
            writes: self.writes.into_values().collect(),
            aborted: self.aborted,
            dedicated_rows: self.dedicated_rows,
            last_swept_timestamp: self.progress,
            entries_read: self.entries_read,
            processed_all: self.processed_all,
        }
    }
}
