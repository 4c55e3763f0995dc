//! Partitioning scheme and sweep queue constants
//!
//! Timestamps are grouped into fine partitions nested inside coarse ones.
//! A sweep batch never reads more than one fine partition at a time; the
//! coarse partitions bound how many index rows are scanned to find the next
//! non-empty fine partition.

/// Width of a coarse partition
pub const TS_COARSE_GRANULARITY: i64 = 10_000_000;
/// Width of a fine partition
pub const TS_FINE_GRANULARITY: i64 = 50_000;
/// Fine partitions per coarse partition
pub const FINE_PARTITIONS_PER_COARSE: i64 = TS_COARSE_GRANULARITY / TS_FINE_GRANULARITY;

/// Entries a single batch aims to read before finishing the current start timestamp
pub const SWEEP_BATCH_SIZE: usize = 1000;
/// Writes of one start timestamp stored inline before overflowing into dedicated rows
pub const MAX_CELLS_GENERIC: usize = 50;
/// Writes per dedicated row
pub const MAX_CELLS_DEDICATED: usize = 100_000;
/// Cells per delete or sentinel call against the store
pub const BATCH_SIZE_KVS: usize = 100;

/// Progress of a shard that was never swept, below every real timestamp
pub const INITIAL_TIMESTAMP: i64 = -1;
/// Shard count assumed when none was persisted
pub const DEFAULT_SHARDS: u32 = 1;
/// Largest supported shard count
pub const MAX_SHARDS: u32 = 256;

const _: () = assert!(TS_COARSE_GRANULARITY % TS_FINE_GRANULARITY == 0);

/// Fine partition containing `timestamp`
#[inline]
pub fn ts_partition_fine(timestamp: i64) -> i64 {
    timestamp / TS_FINE_GRANULARITY
}

/// Coarse partition containing `timestamp`
#[inline]
pub fn ts_partition_coarse(timestamp: i64) -> i64 {
    timestamp / TS_COARSE_GRANULARITY
}

/// Coarse partition that contains fine partition `fine`
#[inline]
pub fn coarse_partition_for_fine(fine: i64) -> i64 {
    fine / FINE_PARTITIONS_PER_COARSE
}

/// Smallest timestamp in fine partition `fine`
#[inline]
pub fn min_ts_for_fine_partition(fine: i64) -> i64 {
    fine.saturating_mul(TS_FINE_GRANULARITY)
}

/// Largest timestamp in fine partition `fine`
#[inline]
pub fn max_ts_for_fine_partition(fine: i64) -> i64 {
    min_ts_for_fine_partition(fine).saturating_add(TS_FINE_GRANULARITY - 1)
}

/// Largest timestamp in coarse partition `coarse`
#[inline]
pub fn max_ts_for_coarse_partition(coarse: i64) -> i64 {
    coarse
        .saturating_mul(TS_COARSE_GRANULARITY)
        .saturating_add(TS_COARSE_GRANULARITY - 1)
}
