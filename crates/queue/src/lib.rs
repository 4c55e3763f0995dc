//! Targeted sweep queue
//!
//! Persists sweep candidates in the key-value store they describe and turns
//! them into physical deletes:
//! - partitioning: timestamp partitions and queue constants
//! - sweepable_cells / sweepable_timestamps: the candidate tables and their index
//! - progress: per-queue sweep cursors and the shard count
//! - commit_ts_cache: commit-status lookups for the batch reader
//! - batch: sweep batches and their accumulation
//! - deleter / cleaner: applying a batch and pruning the queue behind it
//! - queue: the `SweepQueue` façade
//!
//! # Example
//!
//! ```ignore
//! let queue = SweepQueue::create(kvs, transactions, Arc::new(NoOpFollower), metrics, 1)?;
//! queue.enqueue(&writes, 1)?;
//! let outcome = queue.sweep_next_batch(ShardAndStrategy::conservative(0), sweep_ts)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod cleaner;
pub mod commit_ts_cache;
pub mod deleter;
pub mod encoding;
pub mod metrics;
pub mod partitioning;
pub mod progress;
pub mod queue;
pub mod sweepable_cells;
pub mod sweepable_timestamps;
pub mod write_info_partitioner;

pub use batch::{DedicatedRows, SweepBatch, SweepBatchAccumulator};
pub use cleaner::SweepCleaner;
pub use commit_ts_cache::CommitTsCache;
pub use deleter::SweepDeleter;
pub use metrics::{StrategyMetrics, SweepOutcome, TargetedSweepMetrics};
pub use partitioning::{
    max_ts_for_coarse_partition, max_ts_for_fine_partition, min_ts_for_fine_partition, ts_partition_coarse,
    ts_partition_fine, BATCH_SIZE_KVS, DEFAULT_SHARDS, INITIAL_TIMESTAMP, MAX_CELLS_DEDICATED, MAX_CELLS_GENERIC,
    MAX_SHARDS, SWEEP_BATCH_SIZE, TS_COARSE_GRANULARITY, TS_FINE_GRANULARITY,
};
pub use progress::ShardProgress;
pub use queue::SweepQueue;
pub use sweepable_cells::{QueueEntry, SweepableCells};
pub use sweepable_timestamps::SweepableTimestamps;
pub use write_info_partitioner::WriteInfoPartitioner;
