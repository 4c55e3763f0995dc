//! Background sweeping across several sweeper instances
//!
//! Sweepers sharing one store and one lock service must split the shards
//! between them: every (shard, strategy) lease is taken by exactly one
//! worker, swept, and released afterwards.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tsweep_concurrency::{InMemoryTimelockService, InMemoryTransactionService, ManualTimestampsSupplier};
use tsweep_core::{
    Cell, KeyValueService, LockRequest, LockToken, Result, ShardAndStrategy, SweepStrategy, TableMetadata,
    TableRef, TableSweepStrategy, TimelockService,
};
use tsweep_engine::{RetryingCallback, SweepResources, TargetedSweepConfig, TargetedSweeper};
use tsweep_queue::{SweepOutcome, INITIAL_TIMESTAMP, TS_COARSE_GRANULARITY};
use tsweep_storage::InMemoryKeyValueService;

// ============================================================================
// Helper Functions
// ============================================================================

const SWEEP_TS: i64 = 5 * TS_COARSE_GRANULARITY;

/// Grants each descriptor once and never lets it go, even on unlock
#[derive(Default)]
struct StickyLockService {
    next_token: AtomicU64,
    granted: Mutex<BTreeMap<String, LockToken>>,
    requested: Mutex<Vec<String>>,
    unlocked: Mutex<Vec<LockToken>>,
}

impl StickyLockService {
    fn granted_tokens(&self) -> BTreeSet<LockToken> {
        self.granted.lock().values().copied().collect()
    }

    fn unlocked_tokens(&self) -> Vec<LockToken> {
        self.unlocked.lock().clone()
    }

    fn requested_lock_ids(&self) -> BTreeSet<String> {
        self.requested.lock().iter().cloned().collect()
    }
}

impl TimelockService for StickyLockService {
    fn current_time_millis(&self) -> Result<i64> {
        Ok(0)
    }

    fn lock(&self, request: &LockRequest) -> Result<Option<LockToken>> {
        let lock_id = request
            .descriptors
            .iter()
            .next()
            .map(|descriptor| descriptor.lock_id().to_string())
            .unwrap_or_default();
        self.requested.lock().push(lock_id.clone());

        let mut granted = self.granted.lock();
        if granted.contains_key(&lock_id) {
            return Ok(None);
        }
        let id = self.next_token.fetch_add(1, Ordering::SeqCst);
        let token = LockToken::of(uuid::Uuid::from_u64_pair(id, 0));
        granted.insert(lock_id, token);
        Ok(Some(token))
    }

    fn unlock(&self, tokens: &HashSet<LockToken>) -> Result<HashSet<LockToken>> {
        self.unlocked.lock().extend(tokens.iter().copied());
        Ok(HashSet::new())
    }

    fn refresh_lock_leases(&self, tokens: &HashSet<LockToken>) -> Result<HashSet<LockToken>> {
        Ok(tokens.clone())
    }
}

fn background_config(shards: u32, threads: usize) -> TargetedSweepConfig {
    TargetedSweepConfig {
        shards,
        conservative_threads: threads,
        thorough_threads: 0,
        pause_millis: 10,
        lock_acquire_timeout_millis: 0,
        ..TargetedSweepConfig::default()
    }
}

fn resources(kvs: Arc<InMemoryKeyValueService>, timelock: Arc<dyn TimelockService>) -> SweepResources {
    SweepResources::new(
        kvs,
        Arc::new(InMemoryTransactionService::new()),
        Arc::new(ManualTimestampsSupplier::new(SWEEP_TS, SWEEP_TS)),
        timelock,
    )
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn start_sweepers(
    count: usize,
    shards: u32,
    threads: usize,
    kvs: &Arc<InMemoryKeyValueService>,
    timelock: &Arc<StickyLockService>,
) -> Vec<TargetedSweeper> {
    (0..count)
        .map(|_| {
            let sweeper = TargetedSweeper::create_uninitialized(background_config(shards, threads)).unwrap();
            sweeper
                .initialize(resources(kvs.clone(), timelock.clone()))
                .unwrap();
            sweeper
        })
        .collect()
}

// ============================================================================
// Shard Distribution
// ============================================================================

#[test]
fn test_sweepers_split_shards_and_unlock_afterwards() {
    let shards = 16;
    let kvs = Arc::new(InMemoryKeyValueService::new());
    let timelock = Arc::new(StickyLockService::default());
    let sweepers = start_sweepers(4, shards, 4, &kvs, &timelock);

    wait_for("every lease to be released", || {
        timelock.unlocked_tokens().len() >= shards as usize
    });
    for sweeper in &sweepers {
        sweeper.shutdown();
    }

    for shard in 0..shards {
        assert_eq!(
            sweepers[0]
                .get_last_swept_timestamp(ShardAndStrategy::conservative(shard))
                .unwrap(),
            SWEEP_TS - 1,
            "shard {shard}"
        );
    }

    // Each lease was granted once and handed back exactly once
    let granted = timelock.granted_tokens();
    let unlocked = timelock.unlocked_tokens();
    assert_eq!(granted.len(), shards as usize);
    assert_eq!(unlocked.len(), granted.len());
    assert_eq!(unlocked.into_iter().collect::<BTreeSet<_>>(), granted);
}

#[test]
fn test_extra_sweepers_give_up_on_held_leases() {
    let shards = 8;
    let kvs = Arc::new(InMemoryKeyValueService::new());
    let timelock = Arc::new(StickyLockService::default());
    let sweepers = start_sweepers(4, shards, 4, &kvs, &timelock);

    wait_for("lock misses to be registered", || {
        sweepers.iter().any(|sweeper| {
            sweeper
                .metrics()
                .snapshot(SweepStrategy::Conservative)
                .outcome_count(SweepOutcome::UnableToAcquireLock)
                > 0
        })
    });
    wait_for("every lease to be released", || {
        timelock.unlocked_tokens().len() >= shards as usize
    });
    for sweeper in &sweepers {
        sweeper.shutdown();
    }

    let expected: BTreeSet<String> = (0..shards)
        .map(|shard| ShardAndStrategy::conservative(shard).to_text())
        .collect();
    assert_eq!(timelock.requested_lock_ids(), expected);
}

#[test]
fn test_background_sweep_cleans_enqueued_writes() {
    let kvs = Arc::new(InMemoryKeyValueService::new());
    let table = TableRef::new("test.background");
    kvs.create_table(&table, TableMetadata::with_sweep_strategy(TableSweepStrategy::Conservative))
        .unwrap();
    let txns = Arc::new(InMemoryTransactionService::new());
    let cell = Cell::new(b"row".to_vec(), b"col".to_vec());
    for ts in [10, 20] {
        txns.commit(ts, ts).unwrap();
        kvs.put(&table, &BTreeMap::from([(cell.clone(), b"v".to_vec())]), ts)
            .unwrap();
    }

    let timelock = Arc::new(InMemoryTimelockService::new());
    let sweeper = TargetedSweeper::create_uninitialized(background_config(1, 1)).unwrap();
    sweeper
        .initialize_without_running(SweepResources::new(
            kvs.clone(),
            txns,
            Arc::new(ManualTimestampsSupplier::new(SWEEP_TS, SWEEP_TS)),
            timelock.clone(),
        ))
        .unwrap();
    let writes: Vec<_> = [10, 20]
        .into_iter()
        .map(|ts| tsweep_core::WriteInfo::write(table.clone(), cell.clone(), ts))
        .collect();
    sweeper.enqueue(&writes).unwrap();
    sweeper.run_in_background().unwrap();

    wait_for("the queue to be swept", || {
        sweeper
            .get_last_swept_timestamp(ShardAndStrategy::conservative(0))
            .unwrap()
            == SWEEP_TS - 1
    });
    sweeper.shutdown();

    assert_eq!(kvs.get_all_timestamps(&table, &cell), vec![-1, 20]);
    assert!(timelock.held_descriptors().is_empty());
}

#[test]
fn test_blocked_shard_releases_lease_after_empty_batches() {
    let kvs = Arc::new(InMemoryKeyValueService::new());
    let table = TableRef::new("test.blocked");
    kvs.create_table(&table, TableMetadata::with_sweep_strategy(TableSweepStrategy::Conservative))
        .unwrap();
    let txns = Arc::new(InMemoryTransactionService::new());
    let cell = Cell::new(b"row".to_vec(), b"col".to_vec());
    txns.commit(10, 2 * SWEEP_TS).unwrap();
    kvs.put(&table, &BTreeMap::from([(cell.clone(), b"v".to_vec())]), 10)
        .unwrap();

    let timelock = Arc::new(InMemoryTimelockService::new());
    let config = TargetedSweepConfig {
        lease_budget_millis: 600_000,
        ..background_config(1, 1)
    };
    let sweeper = TargetedSweeper::create_uninitialized(config).unwrap();
    sweeper
        .initialize_without_running(SweepResources::new(
            kvs.clone(),
            txns,
            Arc::new(ManualTimestampsSupplier::new(SWEEP_TS, SWEEP_TS)),
            timelock.clone(),
        ))
        .unwrap();
    sweeper
        .enqueue(&[tsweep_core::WriteInfo::write(table.clone(), cell.clone(), 10)])
        .unwrap();
    sweeper.run_in_background().unwrap();

    // Released well before the lease budget, then taken again on a later iteration
    wait_for("the lease to be released twice", || timelock.unlock_calls() >= 2);
    sweeper.shutdown();

    let metrics = sweeper.metrics().snapshot(SweepStrategy::Conservative);
    assert_eq!(metrics.outcome_count(SweepOutcome::Success), 0);
    assert!(metrics.outcome_count(SweepOutcome::NothingToSweep) >= 3);
    assert_eq!(
        sweeper.get_last_swept_timestamp(ShardAndStrategy::conservative(0)).unwrap(),
        INITIAL_TIMESTAMP
    );
    assert_eq!(kvs.get_all_timestamps(&table, &cell), vec![10]);
}

// ============================================================================
// Initialization Callback
// ============================================================================

#[test]
fn test_callback_initializes_once_store_comes_up() {
    let kvs = Arc::new(InMemoryKeyValueService::uninitialized());
    let sweeper = Arc::new(TargetedSweeper::create_uninitialized(background_config(1, 1)).unwrap());
    let callback = Arc::new(RetryingCallback::with_retry_pause(
        sweeper.clone(),
        Duration::from_millis(1),
    ));
    let resources = resources(kvs.clone(), Arc::new(InMemoryTimelockService::new()));

    let runner = {
        let callback = callback.clone();
        thread::spawn(move || callback.run_with_retry(&resources))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!sweeper.is_initialized());

    kvs.set_initialized(true);
    assert!(runner.join().unwrap().unwrap());
    assert!(sweeper.is_initialized());
    assert!(sweeper.is_running_in_background());
    sweeper.shutdown();
}

#[test]
fn test_callback_shutdown_stops_waiting_for_store() {
    let kvs = Arc::new(InMemoryKeyValueService::uninitialized());
    let sweeper = Arc::new(TargetedSweeper::create_uninitialized(background_config(1, 1)).unwrap());
    let callback = Arc::new(RetryingCallback::with_retry_pause(
        sweeper.clone(),
        Duration::from_millis(1),
    ));
    let resources = resources(kvs, Arc::new(InMemoryTimelockService::new()));

    let runner = {
        let callback = callback.clone();
        thread::spawn(move || callback.run_with_retry(&resources))
    };
    thread::sleep(Duration::from_millis(20));
    callback.block_until_safe_to_shutdown();

    assert!(!runner.join().unwrap().unwrap());
    assert!(!sweeper.is_initialized());
}
