//! The targeted sweeper
//!
//! `TargetedSweeper` is created uninitialized and becomes ready once it is
//! handed its collaborators over an initialized store. There is no way back:
//! a ready sweeper stays ready until dropped. Writers call `enqueue` for
//! every committed transaction; sweeping happens either through explicit
//! `sweep_next_batch` calls or through background workers.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use tsweep_core::{
    Cell, Error, KeyValueService, NoOpFollower, Result, ShardAndStrategy, SweepStrategy, TableRef,
    TargetedSweepFollower, TimelockService, TimestampsSupplier, TransactionService, WriteInfo,
};
use tsweep_queue::{SweepOutcome, SweepQueue, TargetedSweepMetrics, MAX_SHARDS};

use crate::background::{BackgroundSweeper, ShardSweeper};
use crate::callback::Callback;
use crate::config::TargetedSweepConfig;

const COMPONENT: &str = "Targeted Sweeper";

/// Runtime switch for sweeping, read before every batch
pub type EnabledSupplier = Arc<dyn Fn() -> bool + Send + Sync>;

/// Runtime shard count, read on every enqueue
pub type ShardsSupplier = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Collaborators a sweeper needs to become ready
#[derive(Clone)]
pub struct SweepResources {
    /// Store holding both the swept tables and the queue
    pub kvs: Arc<dyn KeyValueService>,
    /// Commit statuses of start timestamps
    pub transactions: Arc<dyn TransactionService>,
    /// Source of the conservative and thorough sweep boundaries
    pub timestamps: Arc<dyn TimestampsSupplier>,
    /// Lease provider for background workers
    pub timelock: Arc<dyn TimelockService>,
    /// Notified with the cells of each swept batch
    pub follower: Arc<dyn TargetedSweepFollower>,
}

impl SweepResources {
    /// Resources with a follower that does nothing
    pub fn new(
        kvs: Arc<dyn KeyValueService>,
        transactions: Arc<dyn TransactionService>,
        timestamps: Arc<dyn TimestampsSupplier>,
        timelock: Arc<dyn TimelockService>,
    ) -> Self {
        Self {
            kvs,
            transactions,
            timestamps,
            timelock,
            follower: Arc::new(NoOpFollower),
        }
    }

    /// Replace the follower
    pub fn with_follower(mut self, follower: Arc<dyn TargetedSweepFollower>) -> Self {
        self.follower = follower;
        self
    }
}

// ============================================================================
// Ready state
// ============================================================================

struct ReadySweeper {
    queue: SweepQueue,
    timestamps: Arc<dyn TimestampsSupplier>,
    timelock: Arc<dyn TimelockService>,
    enabled: EnabledSupplier,
    shards: ShardsSupplier,
    metrics: Arc<TargetedSweepMetrics>,
}

impl ReadySweeper {
    fn sweep_timestamp(&self, strategy: SweepStrategy) -> Result<i64> {
        match strategy {
            SweepStrategy::Conservative => self.timestamps.immutable_timestamp(),
            SweepStrategy::Thorough => self.timestamps.unreadable_timestamp(),
        }
    }

    fn sweep(&self, ss: ShardAndStrategy) -> Result<SweepOutcome> {
        if !(self.enabled)() {
            return Ok(SweepOutcome::Disabled);
        }
        let sweep_ts = self.sweep_timestamp(ss.strategy)?;
        self.metrics.update_sweep_timestamp(ss.strategy, sweep_ts);
        self.queue.sweep_next_batch(ss, sweep_ts)
    }
}

impl ShardSweeper for ReadySweeper {
    fn sweep_next_batch(&self, ss: ShardAndStrategy) -> Result<SweepOutcome> {
        let result = self.sweep(ss);
        let outcome = match &result {
            Ok(outcome) => *outcome,
            Err(e) => {
                debug!(target: "tsweep::sweep", %ss, error = %e, "Sweep failed");
                SweepOutcome::Error
            }
        };
        self.metrics.register_occurrence_of(ss.strategy, outcome);
        result
    }

    /// Configured shards may exceed the persisted count until the next enqueue
    fn number_of_shards(&self) -> Result<u32> {
        let persisted = self.queue.get_number_of_shards()?;
        Ok(persisted.max((self.shards)().clamp(1, MAX_SHARDS)))
    }
}

// ============================================================================
// TargetedSweeper
// ============================================================================

/// Sweeps enqueued writes, on demand or in the background
///
/// # Example
///
/// ```ignore
/// let sweeper = TargetedSweeper::create_uninitialized(TargetedSweepConfig::default())?;
/// sweeper.initialize_without_running(SweepResources::new(kvs, txns, timestamps, timelock))?;
/// sweeper.enqueue(&writes)?;
/// sweeper.sweep_next_batch(ShardAndStrategy::conservative(0))?;
/// ```
pub struct TargetedSweeper {
    config: TargetedSweepConfig,
    enabled: EnabledSupplier,
    shards: ShardsSupplier,
    metrics: Arc<TargetedSweepMetrics>,
    ready: RwLock<Option<Arc<ReadySweeper>>>,
    background: Mutex<Option<BackgroundSweeper>>,
    shut_down: AtomicBool,
}

impl TargetedSweeper {
    /// Uninitialized sweeper whose enable flag and shard count are fixed
    /// to the config values
    pub fn create_uninitialized(config: TargetedSweepConfig) -> Result<Self> {
        let enabled = config.enabled;
        let shards = config.shards;
        Self::with_suppliers(config, Arc::new(move || enabled), Arc::new(move || shards))
    }

    /// Uninitialized sweeper reading its enable flag and shard count from
    /// the given suppliers
    pub fn with_suppliers(
        config: TargetedSweepConfig,
        enabled: EnabledSupplier,
        shards: ShardsSupplier,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            enabled,
            shards,
            metrics: Arc::new(TargetedSweepMetrics::new()),
            ready: RwLock::new(None),
            background: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Become ready and start the background workers
    pub fn initialize(&self, resources: SweepResources) -> Result<()> {
        self.initialize_without_running(resources)?;
        self.run_in_background()
    }

    /// Become ready without starting background workers
    ///
    /// Creates the queue tables in the store. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// `IllegalState` if the store reports itself uninitialized.
    pub fn initialize_without_running(&self, resources: SweepResources) -> Result<()> {
        let mut ready = self.ready.write();
        if ready.is_some() {
            return Ok(());
        }
        if !resources.kvs.is_initialized() {
            return Err(Error::IllegalState(
                "Attempted to initialize targeted sweeper with an uninitialized key value service".to_string(),
            ));
        }

        let queue = SweepQueue::create(
            resources.kvs,
            resources.transactions,
            resources.follower,
            Arc::clone(&self.metrics),
            self.config.max_partitions_per_batch,
        )?;
        *ready = Some(Arc::new(ReadySweeper {
            queue,
            timestamps: resources.timestamps,
            timelock: resources.timelock,
            enabled: Arc::clone(&self.enabled),
            shards: Arc::clone(&self.shards),
            metrics: Arc::clone(&self.metrics),
        }));
        info!(target: "tsweep::sweep", shards = (self.shards)(), "Initialized targeted sweeper");
        Ok(())
    }

    /// Start the configured background workers
    ///
    /// A no-op when they are already running.
    pub fn run_in_background(&self) -> Result<()> {
        let ready = self.ready()?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::IllegalState("targeted sweeper has been shut down".to_string()));
        }
        let mut background = self.background.lock();
        if background.is_some() {
            return Ok(());
        }
        let timelock = Arc::clone(&ready.timelock);
        *background = Some(BackgroundSweeper::start(
            ready,
            timelock,
            Arc::clone(&self.metrics),
            self.config.clone(),
        )?);
        Ok(())
    }

    /// Stop background workers, waiting for in-flight batches
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let background = self.background.lock().take();
        if let Some(background) = background {
            background.shutdown();
        }
    }

    fn ready(&self) -> Result<Arc<ReadySweeper>> {
        self.ready
            .read()
            .clone()
            .ok_or(Error::NotInitialized { component: COMPONENT })
    }

    /// Whether initialization has completed
    pub fn is_initialized(&self) -> bool {
        self.ready.read().is_some()
    }

    /// Whether background workers are running
    pub fn is_running_in_background(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Metrics of this sweeper
    pub fn metrics(&self) -> &Arc<TargetedSweepMetrics> {
        &self.metrics
    }

    /// Configuration this sweeper was created with
    pub fn config(&self) -> &TargetedSweepConfig {
        &self.config
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Record committed writes as sweep candidates
    ///
    /// # Errors
    ///
    /// `NotInitialized` before initialization; `InvalidConfiguration` if the
    /// shard supplier returns fewer shards than are already in use.
    pub fn enqueue(&self, writes: &[WriteInfo]) -> Result<()> {
        let ready = self.ready()?;
        ready.queue.enqueue(writes, (self.shards)())
    }

    /// Record every write of a transaction started at `start_ts`
    ///
    /// An empty value is a deletion and is enqueued as a tombstone.
    pub fn enqueue_transaction(
        &self,
        start_ts: i64,
        writes: &BTreeMap<TableRef, BTreeMap<Cell, Vec<u8>>>,
    ) -> Result<()> {
        let infos: Vec<WriteInfo> = writes
            .iter()
            .flat_map(|(table, cells)| {
                cells.iter().map(move |(cell, value)| {
                    if value.is_empty() {
                        WriteInfo::tombstone(table.clone(), cell.clone(), start_ts)
                    } else {
                        WriteInfo::write(table.clone(), cell.clone(), start_ts)
                    }
                })
            })
            .collect();
        self.enqueue(&infos)
    }

    /// Sweep the next batch of `ss`
    ///
    /// The outcome is also registered in the metrics; a failure registers
    /// `Error` and is returned to the caller.
    pub fn sweep_next_batch(&self, ss: ShardAndStrategy) -> Result<SweepOutcome> {
        self.ready()?.sweep_next_batch(ss)
    }

    /// Last timestamp fully swept for `ss`
    pub fn get_last_swept_timestamp(&self, ss: ShardAndStrategy) -> Result<i64> {
        self.ready()?.queue.get_last_swept_timestamp(ss)
    }

    /// Shard count persisted in the store
    pub fn get_number_of_shards(&self) -> Result<u32> {
        self.ready()?.queue.get_number_of_shards()
    }
}

impl Drop for TargetedSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Initializes and starts the sweeper, retrying while the store is not ready
///
/// Wrap in a [`RetryingCallback`](crate::callback::RetryingCallback) to
/// initialize as soon as the store comes up.
impl Callback<SweepResources> for TargetedSweeper {
    fn init(&self, resources: &SweepResources) -> Result<()> {
        self.initialize(resources.clone())
    }

    fn cleanup(&self, resources: &SweepResources, init_error: Error) -> Result<()> {
        if resources.kvs.is_initialized() {
            return Err(init_error);
        }
        debug!(target: "tsweep::sweep", error = %init_error, "Store not initialized yet, retrying");
        Ok(())
    }
}
