//! The sweep queue: enqueue candidates, sweep one batch at a time
//!
//! `SweepQueue` wires the queue stores, the batch reader, the deleter and the
//! cleaner together. It holds no mutable state of its own; everything it
//! knows lives in the key-value store, so any number of instances, in any
//! number of processes, may run against the same store.

use std::sync::Arc;
use tracing::debug;

use tsweep_core::{
    Error, KeyValueService, Result, ShardAndStrategy, TableMetadata, TableSweepStrategy,
    TargetedSweepFollower, TransactionService, WriteInfo,
};

use crate::batch::{SweepBatch, SweepBatchAccumulator};
use crate::cleaner::SweepCleaner;
use crate::commit_ts_cache::CommitTsCache;
use crate::deleter::SweepDeleter;
use crate::encoding::{sweep_progress_table, sweepable_cells_table, sweepable_timestamps_table};
use crate::metrics::{SweepOutcome, TargetedSweepMetrics};
use crate::progress::ShardProgress;
use crate::sweepable_cells::SweepableCells;
use crate::sweepable_timestamps::SweepableTimestamps;
use crate::write_info_partitioner::WriteInfoPartitioner;

/// Entry point for enqueueing writes and sweeping them
pub struct SweepQueue {
    progress: Arc<ShardProgress>,
    timestamps: Arc<SweepableTimestamps>,
    cells: Arc<SweepableCells>,
    deleter: SweepDeleter,
    cleaner: SweepCleaner,
    partitioner: WriteInfoPartitioner,
    metrics: Arc<TargetedSweepMetrics>,
    max_partitions: usize,
}

impl SweepQueue {
    /// Queue over `kvs`, creating the queue tables if needed
    ///
    /// A single batch accumulates at most `max_partitions` fine partitions.
    pub fn create(
        kvs: Arc<dyn KeyValueService>,
        transactions: Arc<dyn TransactionService>,
        follower: Arc<dyn TargetedSweepFollower>,
        metrics: Arc<TargetedSweepMetrics>,
        max_partitions: usize,
    ) -> Result<Self> {
        for table in [sweepable_cells_table(), sweepable_timestamps_table(), sweep_progress_table()] {
            kvs.create_table(&table, TableMetadata::with_sweep_strategy(TableSweepStrategy::Nothing))?;
        }

        let commit_ts_cache = Arc::new(CommitTsCache::new(transactions));
        let progress = Arc::new(ShardProgress::new(kvs.clone()));
        let timestamps = Arc::new(SweepableTimestamps::new(kvs.clone()));
        let cells = Arc::new(SweepableCells::new(kvs.clone(), commit_ts_cache));
        Ok(Self {
            deleter: SweepDeleter::new(kvs.clone(), follower),
            cleaner: SweepCleaner::new(cells.clone(), timestamps.clone(), progress.clone()),
            partitioner: WriteInfoPartitioner::new(kvs),
            progress,
            timestamps,
            cells,
            metrics,
            max_partitions: max_partitions.max(1),
        })
    }

    /// Metrics updated by this queue
    pub fn metrics(&self) -> &Arc<TargetedSweepMetrics> {
        &self.metrics
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Record `writes` as sweep candidates, sharded over `configured_shards`
    ///
    /// The persisted shard count is raised to `configured_shards` first.
    /// Configuring fewer shards than were ever persisted is rejected, since
    /// candidates already queued on the higher shards would never be swept.
    pub fn enqueue(&self, writes: &[WriteInfo], configured_shards: u32) -> Result<()> {
        let persisted = self.progress.update_number_of_shards(configured_shards)?;
        if configured_shards < persisted {
            return Err(Error::InvalidConfiguration(format!(
                "configured {configured_shards} shards but {persisted} are already in use; \
                 the number of shards can only increase"
            )));
        }

        let partitioned = self
            .partitioner
            .partition_writes_by_shard_strategy(writes, persisted)?;
        for (ss, writes) in partitioned {
            // Cells first: an index entry must never point at an empty partition
            self.cells.enqueue(ss, &writes)?;
            self.timestamps.enqueue(ss, &writes)?;
            self.metrics
                .update_enqueued_writes(ss.strategy, writes.len() as u64);
            debug!(target: "tsweep::queue", %ss, writes = writes.len(), "Enqueued writes");
        }
        Ok(())
    }

    // ========================================================================
    // Sweep
    // ========================================================================

    /// Sweep the next batch of `ss` below the exclusive `sweep_ts`
    ///
    /// Returns `Success` when the pass read queue entries and either deleted
    /// something or moved progress, and `NothingToSweep` otherwise. Progress only moves forward; a sweep
    /// timestamp at or below the current progress leaves everything as is.
    pub fn sweep_next_batch(&self, ss: ShardAndStrategy, sweep_ts: i64) -> Result<SweepOutcome> {
        let last_swept = self.progress.get_last_swept_timestamp(ss)?;
        if sweep_ts <= last_swept.saturating_add(1) {
            return Ok(SweepOutcome::NothingToSweep);
        }

        let batch = self.read_batch(ss, sweep_ts, last_swept)?;
        self.apply(ss, last_swept, &batch)?;

        // A pass blocked on an unsweepable start timestamp reads entries but changes nothing
        let made_progress = !batch.is_empty() || batch.last_swept_timestamp > last_swept;
        if batch.entries_read > 0 && made_progress {
            Ok(SweepOutcome::Success)
        } else {
            Ok(SweepOutcome::NothingToSweep)
        }
    }

    fn read_batch(&self, ss: ShardAndStrategy, sweep_ts: i64, last_swept: i64) -> Result<SweepBatch> {
        let mut accumulator = SweepBatchAccumulator::new(sweep_ts, last_swept, self.max_partitions);
        loop {
            let next = self.timestamps.next_sweepable_timestamp_partition(
                ss,
                accumulator.progress(),
                sweep_ts,
            )?;
            match next {
                Some(fine) => {
                    let batch =
                        self.cells
                            .get_batch_for_partition(ss, fine, accumulator.progress(), sweep_ts - 1)?;
                    accumulator.accumulate(batch);
                }
                None => accumulator.finish_without_candidates(),
            }
            if next.is_none() || !accumulator.should_accept_additional_batch() {
                return Ok(accumulator.into_batch());
            }
        }
    }

    fn apply(&self, ss: ShardAndStrategy, last_swept: i64, batch: &SweepBatch) -> Result<()> {
        let strategy = ss.strategy;
        self.metrics
            .update_entries_read(strategy, batch.entries_read as u64);

        if !batch.writes.is_empty() {
            let sentinels = self.deleter.sweep(&batch.writes, strategy)?;
            self.metrics.update_sweeper_tombstones(strategy, sentinels);
        }
        if !batch.aborted.is_empty() {
            let deleted = self.deleter.delete_aborted(&batch.aborted)?;
            self.metrics.update_aborted_writes_deleted(strategy, deleted);
        }

        self.cleaner
            .clean(ss, last_swept, batch.last_swept_timestamp, &batch.dedicated_rows)?;
        self.metrics
            .update_progress_for_shard(ss, batch.last_swept_timestamp.max(last_swept));

        debug!(
            target: "tsweep::sweep",
            %ss,
            entries_read = batch.entries_read,
            writes = batch.writes.len(),
            aborted = batch.aborted.len(),
            last_swept = batch.last_swept_timestamp,
            "Swept batch"
        );
        Ok(())
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Last timestamp fully swept for `ss`
    pub fn get_last_swept_timestamp(&self, ss: ShardAndStrategy) -> Result<i64> {
        self.progress.get_last_swept_timestamp(ss)
    }

    /// Persisted shard count
    pub fn get_number_of_shards(&self) -> Result<u32> {
        self.progress.get_number_of_shards()
    }
}
