//! Targeted sweep metrics
//!
//! One set of counters per sweep strategy. Counters are purely observational
//! and use Relaxed ordering. The sweep timestamp gauge holds the most recent
//! value written; the last swept timestamp is the lowest progress of any
//! shard swept so far.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use tsweep_core::{ShardAndStrategy, SweepStrategy};

use crate::partitioning::INITIAL_TIMESTAMP;

/// Result of one sweep iteration on a (shard, strategy) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepOutcome {
    /// A batch was read and applied
    Success,
    /// Nothing was pending below the sweep timestamp
    NothingToSweep,
    /// Sweeping is switched off
    Disabled,
    /// The iteration failed; retried on a later tick
    Error,
    /// Another worker holds the lease for the pair
    UnableToAcquireLock,
}

impl SweepOutcome {
    /// Every outcome, in reporting order
    pub const ALL: [SweepOutcome; 5] = [
        SweepOutcome::Success,
        SweepOutcome::NothingToSweep,
        SweepOutcome::Disabled,
        SweepOutcome::Error,
        SweepOutcome::UnableToAcquireLock,
    ];

    fn index(self) -> usize {
        match self {
            SweepOutcome::Success => 0,
            SweepOutcome::NothingToSweep => 1,
            SweepOutcome::Disabled => 2,
            SweepOutcome::Error => 3,
            SweepOutcome::UnableToAcquireLock => 4,
        }
    }

    /// Whether this outcome counts towards releasing a lease
    pub fn is_idle(self) -> bool {
        matches!(self, SweepOutcome::NothingToSweep | SweepOutcome::Disabled)
    }
}

impl fmt::Display for SweepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepOutcome::Success => "SUCCESS",
            SweepOutcome::NothingToSweep => "NOTHING_TO_SWEEP",
            SweepOutcome::Disabled => "DISABLED",
            SweepOutcome::Error => "ERROR",
            SweepOutcome::UnableToAcquireLock => "UNABLE_TO_ACQUIRE_LOCK",
        };
        f.write_str(name)
    }
}

struct StrategyCounters {
    enqueued_writes: AtomicU64,
    entries_read: AtomicU64,
    tombstones_put: AtomicU64,
    aborted_writes_deleted: AtomicU64,
    last_swept_by_shard: DashMap<u32, i64>,
    sweep_timestamp: AtomicI64,
    outcomes: [AtomicU64; 5],
}

impl StrategyCounters {
    fn new() -> Self {
        Self {
            enqueued_writes: AtomicU64::new(0),
            entries_read: AtomicU64::new(0),
            tombstones_put: AtomicU64::new(0),
            aborted_writes_deleted: AtomicU64::new(0),
            last_swept_by_shard: DashMap::new(),
            sweep_timestamp: AtomicI64::new(INITIAL_TIMESTAMP),
            outcomes: Default::default(),
        }
    }

    fn snapshot(&self) -> StrategyMetrics {
        let mut outcomes = [0u64; 5];
        for outcome in SweepOutcome::ALL {
            outcomes[outcome.index()] = self.outcomes[outcome.index()].load(Ordering::Relaxed);
        }
        StrategyMetrics {
            enqueued_writes: self.enqueued_writes.load(Ordering::Relaxed),
            entries_read: self.entries_read.load(Ordering::Relaxed),
            tombstones_put: self.tombstones_put.load(Ordering::Relaxed),
            aborted_writes_deleted: self.aborted_writes_deleted.load(Ordering::Relaxed),
            last_swept_timestamp: self
                .last_swept_by_shard
                .iter()
                .map(|entry| *entry.value())
                .min()
                .unwrap_or(INITIAL_TIMESTAMP),
            sweep_timestamp: self.sweep_timestamp.load(Ordering::Relaxed),
            outcomes,
        }
    }
}

/// Live counters for both strategies
///
/// # Memory Ordering
///
/// All counters use Relaxed ordering: they never synchronize other memory
/// and approximate values are acceptable while sweeps are in flight.
pub struct TargetedSweepMetrics {
    conservative: StrategyCounters,
    thorough: StrategyCounters,
}

impl TargetedSweepMetrics {
    /// Zeroed metrics
    pub fn new() -> Self {
        Self {
            conservative: StrategyCounters::new(),
            thorough: StrategyCounters::new(),
        }
    }

    fn counters(&self, strategy: SweepStrategy) -> &StrategyCounters {
        match strategy {
            SweepStrategy::Conservative => &self.conservative,
            SweepStrategy::Thorough => &self.thorough,
        }
    }

    /// Writes added to the queue
    pub fn update_enqueued_writes(&self, strategy: SweepStrategy, writes: u64) {
        self.counters(strategy)
            .enqueued_writes
            .fetch_add(writes, Ordering::Relaxed);
    }

    /// Queue entries read by a sweep iteration
    pub fn update_entries_read(&self, strategy: SweepStrategy, entries: u64) {
        self.counters(strategy)
            .entries_read
            .fetch_add(entries, Ordering::Relaxed);
    }

    /// Sentinels written by conservative sweep
    pub fn update_sweeper_tombstones(&self, strategy: SweepStrategy, tombstones: u64) {
        self.counters(strategy)
            .tombstones_put
            .fetch_add(tombstones, Ordering::Relaxed);
    }

    /// Versions of aborted transactions removed
    pub fn update_aborted_writes_deleted(&self, strategy: SweepStrategy, writes: u64) {
        self.counters(strategy)
            .aborted_writes_deleted
            .fetch_add(writes, Ordering::Relaxed);
    }

    /// Progress reached on one shard; never moves a shard backwards
    pub fn update_progress_for_shard(&self, ss: ShardAndStrategy, last_swept: i64) {
        let counters = self.counters(ss.strategy);
        let mut progress = counters
            .last_swept_by_shard
            .entry(ss.shard)
            .or_insert(last_swept);
        *progress = (*progress).max(last_swept);
    }

    /// Sweep timestamp seen by the latest sweep iteration
    pub fn update_sweep_timestamp(&self, strategy: SweepStrategy, sweep_ts: i64) {
        self.counters(strategy)
            .sweep_timestamp
            .store(sweep_ts, Ordering::Relaxed);
    }

    /// Count an iteration outcome
    pub fn register_occurrence_of(&self, strategy: SweepStrategy, outcome: SweepOutcome) {
        self.counters(strategy).outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time values for `strategy`
    pub fn snapshot(&self, strategy: SweepStrategy) -> StrategyMetrics {
        self.counters(strategy).snapshot()
    }
}

impl Default for TargetedSweepMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain metric values for one strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyMetrics {
    /// Writes added to the queue
    pub enqueued_writes: u64,
    /// Queue entries read
    pub entries_read: u64,
    /// Sentinels written
    pub tombstones_put: u64,
    /// Aborted writes removed
    pub aborted_writes_deleted: u64,
    /// Lowest progress among the shards swept so far
    pub last_swept_timestamp: i64,
    /// Most recent sweep timestamp
    pub sweep_timestamp: i64,
    outcomes: [u64; 5],
}

impl StrategyMetrics {
    /// Times `outcome` was registered
    pub fn outcome_count(&self, outcome: SweepOutcome) -> u64 {
        self.outcomes[outcome.index()]
    }

    /// Iterations registered in total
    pub fn total_outcomes(&self) -> u64 {
        self.outcomes.iter().sum()
    }
}
