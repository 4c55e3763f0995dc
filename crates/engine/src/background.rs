//! Background sweep workers
//!
//! A fixed pool of worker threads per strategy. Each iteration a worker picks
//! the next (shard, strategy) pair from a counter shared by all workers of
//! the strategy, takes the pair's lease and sweeps it until it runs out of
//! work or lease budget. Workers in different processes converge on disjoint
//! shards through the lock service alone.

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use tsweep_core::{Error, Result, ShardAndStrategy, SweepStrategy, TimelockService};
use tsweep_queue::{SweepOutcome, TargetedSweepMetrics};

use crate::config::TargetedSweepConfig;
use crate::lock::TargetedSweeperLock;

/// What a background worker drives.
///
/// Implementations register the outcome of every sweep themselves; the
/// worker only registers lease misses and its own failures.
pub trait ShardSweeper: Send + Sync {
    /// Sweep one batch of `ss`.
    fn sweep_next_batch(&self, ss: ShardAndStrategy) -> Result<SweepOutcome>;

    /// Number of shards currently in use.
    fn number_of_shards(&self) -> Result<u32>;
}

struct WorkerShared {
    sweeper: Arc<dyn ShardSweeper>,
    timelock: Arc<dyn TimelockService>,
    metrics: Arc<TargetedSweepMetrics>,
    config: TargetedSweepConfig,
    shutdown: AtomicBool,
    pause_lock: Mutex<()>,
    wake: Condvar,
    next_conservative_shard: AtomicU64,
    next_thorough_shard: AtomicU64,
}

/// Pool of background sweep workers, stopped on drop.
pub struct BackgroundSweeper {
    shared: Arc<WorkerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundSweeper {
    /// Spawn the configured number of workers per strategy.
    ///
    /// Workers are named `tsweep-conservative-0`, `tsweep-thorough-0`, etc.
    pub fn start(
        sweeper: Arc<dyn ShardSweeper>,
        timelock: Arc<dyn TimelockService>,
        metrics: Arc<TargetedSweepMetrics>,
        config: TargetedSweepConfig,
    ) -> Result<Self> {
        let shared = Arc::new(WorkerShared {
            sweeper,
            timelock,
            metrics,
            config,
            shutdown: AtomicBool::new(false),
            pause_lock: Mutex::new(()),
            wake: Condvar::new(),
            next_conservative_shard: AtomicU64::new(0),
            next_thorough_shard: AtomicU64::new(0),
        });
        let background = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::new()),
        };

        for strategy in SweepStrategy::ALL {
            for i in 0..shared.config.threads_for(strategy) {
                let worker = Arc::clone(&shared);
                let name = format!("tsweep-{}-{}", strategy.to_string().to_lowercase(), i);
                let handle = std::thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || worker_loop(&worker, strategy))
                    .map_err(|e| Error::IllegalState(format!("failed to spawn {}: {}", name, e)))?;
                background.workers.lock().push(handle);
            }
        }

        info!(
            target: "tsweep::background",
            conservative_threads = shared.config.conservative_threads,
            thorough_threads = shared.config.thorough_threads,
            "Started background sweep"
        );
        Ok(background)
    }

    /// Number of live worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Whether `shutdown` has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Signal every worker to stop and join them.
    ///
    /// A worker finishes the batch it is sweeping and releases its lease
    /// before exiting. Calling this more than once is a no-op.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);

        // Notify under the lock so a worker about to pause cannot miss it
        {
            let _pause = self.shared.pause_lock.lock();
            self.shared.wake.notify_all();
        }

        let mut workers = self.workers.lock();
        let joined = workers.len();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        if joined > 0 {
            info!(target: "tsweep::background", workers = joined, "Stopped background sweep");
        }
    }
}

impl Drop for BackgroundSweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WorkerShared {
    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Sleep for `duration`; returns `false` if shutdown was requested.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.pause_lock.lock();
        while !self.is_shut_down() {
            if self.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        !self.is_shut_down()
    }

    fn shard_counter(&self, strategy: SweepStrategy) -> &AtomicU64 {
        match strategy {
            SweepStrategy::Conservative => &self.next_conservative_shard,
            SweepStrategy::Thorough => &self.next_thorough_shard,
        }
    }

    /// Try each shard at most once until one lease is won.
    fn run_one_iteration(&self, strategy: SweepStrategy) {
        let shards = match self.sweeper.number_of_shards() {
            Ok(shards) => shards.max(1),
            Err(e) => {
                warn!(target: "tsweep::background", %strategy, error = %e, "Failed to read number of shards");
                self.metrics.register_occurrence_of(strategy, SweepOutcome::Error);
                return;
            }
        };

        for _ in 0..shards {
            if self.is_shut_down() {
                return;
            }
            let shard = (self.shard_counter(strategy).fetch_add(1, Ordering::Relaxed) % u64::from(shards)) as u32;
            let ss = ShardAndStrategy::new(shard, strategy);
            match TargetedSweeperLock::try_acquire(
                ss,
                Arc::clone(&self.timelock),
                self.config.lock_acquire_timeout(),
            ) {
                Ok(Some(lock)) => {
                    self.sweep_under_lease(lock);
                    return;
                }
                Ok(None) => {
                    debug!(target: "tsweep::background", %ss, "Shard lease held elsewhere");
                    self.metrics
                        .register_occurrence_of(strategy, SweepOutcome::UnableToAcquireLock);
                }
                Err(e) => {
                    warn!(target: "tsweep::background", %ss, error = %e, "Failed to request shard lease");
                    self.metrics.register_occurrence_of(strategy, SweepOutcome::Error);
                    return;
                }
            }
        }
    }

    fn sweep_under_lease(&self, mut lock: TargetedSweeperLock) {
        let ss = lock.shard_and_strategy();
        let started = Instant::now();
        let mut idle = 0u32;

        while !self.is_shut_down() {
            match self.sweeper.sweep_next_batch(ss) {
                Ok(outcome) if outcome.is_idle() => {
                    idle += 1;
                    if idle >= self.config.max_consecutive_empty_batches {
                        break;
                    }
                }
                Ok(_) => idle = 0,
                Err(e) if e.is_transient() => {
                    warn!(target: "tsweep::background", %ss, error = %e, "Sweep failed, retrying on a later iteration");
                    break;
                }
                Err(e) => {
                    error!(target: "tsweep::background", %ss, error = %e, "Sweep failed");
                    break;
                }
            }
            if started.elapsed() >= self.config.lease_budget() {
                break;
            }
            match lock.refresh() {
                Ok(true) => {}
                Ok(false) => {
                    warn!(target: "tsweep::background", %ss, "Lost shard lease");
                    break;
                }
                Err(e) => {
                    warn!(target: "tsweep::background", %ss, error = %e, "Failed to refresh shard lease");
                    break;
                }
            }
        }
        lock.unlock();
    }
}

fn worker_loop(shared: &WorkerShared, strategy: SweepStrategy) {
    let max_delay = shared.config.initial_delay_millis;
    if max_delay > 0 {
        let delay = rand::thread_rng().gen_range(0..=max_delay);
        if !shared.pause(Duration::from_millis(delay)) {
            return;
        }
    }

    while !shared.is_shut_down() {
        // A panicking sweep must not take the worker down with it
        let iteration =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| shared.run_one_iteration(strategy)));
        if let Err(e) = iteration {
            error!(
                target: "tsweep::background",
                %strategy,
                "background sweep panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
            shared.metrics.register_occurrence_of(strategy, SweepOutcome::Error);
        }
        if !shared.pause(shared.config.pause()) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tsweep_concurrency::InMemoryTimelockService;
    use tsweep_core::LockDescriptor;

    struct FakeSweeper {
        shards: u32,
        outcome: SweepOutcome,
        swept: Mutex<Vec<ShardAndStrategy>>,
    }

    impl FakeSweeper {
        fn new(shards: u32, outcome: SweepOutcome) -> Arc<Self> {
            Arc::new(Self {
                shards,
                outcome,
                swept: Mutex::new(Vec::new()),
            })
        }

        fn swept_shards(&self) -> BTreeSet<ShardAndStrategy> {
            self.swept.lock().iter().copied().collect()
        }
    }

    impl ShardSweeper for FakeSweeper {
        fn sweep_next_batch(&self, ss: ShardAndStrategy) -> Result<SweepOutcome> {
            self.swept.lock().push(ss);
            Ok(self.outcome)
        }

        fn number_of_shards(&self) -> Result<u32> {
            Ok(self.shards)
        }
    }

    fn config(conservative: usize, thorough: usize) -> TargetedSweepConfig {
        TargetedSweepConfig {
            conservative_threads: conservative,
            thorough_threads: thorough,
            pause_millis: 1,
            lock_acquire_timeout_millis: 0,
            ..TargetedSweepConfig::default()
        }
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_workers_visit_every_shard() {
        let sweeper = FakeSweeper::new(4, SweepOutcome::NothingToSweep);
        let timelock = Arc::new(InMemoryTimelockService::new());
        let background = BackgroundSweeper::start(
            sweeper.clone(),
            timelock.clone(),
            Arc::new(TargetedSweepMetrics::new()),
            config(1, 1),
        )
        .unwrap();
        assert_eq!(background.worker_count(), 2);

        assert!(wait_for(|| sweeper.swept_shards().len() == 8));
        background.shutdown();

        assert!(timelock.held_descriptors().is_empty());
        assert!(timelock.unlock_calls() >= 8);
    }

    #[test]
    fn test_idle_outcomes_release_lease() {
        let sweeper = FakeSweeper::new(1, SweepOutcome::NothingToSweep);
        let timelock = Arc::new(InMemoryTimelockService::new());
        let background = BackgroundSweeper::start(
            sweeper.clone(),
            timelock.clone(),
            Arc::new(TargetedSweepMetrics::new()),
            TargetedSweepConfig {
                pause_millis: 60_000,
                ..config(1, 0)
            },
        )
        .unwrap();

        // One lease, three idle outcomes, then a long pause
        assert!(wait_for(|| timelock.unlock_calls() == 1));
        assert_eq!(sweeper.swept.lock().len(), 3);
        background.shutdown();
    }

    #[test]
    fn test_held_lease_registers_unable_to_acquire_lock() {
        let sweeper = FakeSweeper::new(1, SweepOutcome::Success);
        let timelock = Arc::new(InMemoryTimelockService::new());
        let held = timelock
            .lock(&tsweep_core::LockRequest::single(
                LockDescriptor::new(ShardAndStrategy::conservative(0).to_text()),
                Duration::ZERO,
            ))
            .unwrap();
        assert!(held.is_some());

        let metrics = Arc::new(TargetedSweepMetrics::new());
        let background =
            BackgroundSweeper::start(sweeper.clone(), timelock, metrics.clone(), config(1, 0)).unwrap();

        assert!(wait_for(|| {
            metrics
                .snapshot(SweepStrategy::Conservative)
                .outcome_count(SweepOutcome::UnableToAcquireLock)
                > 0
        }));
        background.shutdown();
        assert!(sweeper.swept.lock().is_empty());
    }

    #[test]
    fn test_unavailable_lock_service_registers_error() {
        let sweeper = FakeSweeper::new(1, SweepOutcome::Success);
        let timelock = Arc::new(InMemoryTimelockService::new());
        timelock.set_unavailable(true);
        let metrics = Arc::new(TargetedSweepMetrics::new());
        let background =
            BackgroundSweeper::start(sweeper.clone(), timelock, metrics.clone(), config(0, 1)).unwrap();

        assert!(wait_for(|| {
            metrics
                .snapshot(SweepStrategy::Thorough)
                .outcome_count(SweepOutcome::Error)
                > 0
        }));
        background.shutdown();
        assert!(sweeper.swept.lock().is_empty());
    }

    #[test]
    fn test_shutdown_interrupts_pause() {
        let sweeper = FakeSweeper::new(1, SweepOutcome::NothingToSweep);
        let background = BackgroundSweeper::start(
            sweeper,
            Arc::new(InMemoryTimelockService::new()),
            Arc::new(TargetedSweepMetrics::new()),
            TargetedSweepConfig {
                pause_millis: 60_000,
                initial_delay_millis: 60_000,
                ..config(2, 2)
            },
        )
        .unwrap();

        let started = Instant::now();
        background.shutdown();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(background.is_shut_down());
        assert_eq!(background.worker_count(), 0);

        // Idempotent
        background.shutdown();
    }

    #[test]
    fn test_no_threads_configured() {
        let background = BackgroundSweeper::start(
            FakeSweeper::new(1, SweepOutcome::Success),
            Arc::new(InMemoryTimelockService::new()),
            Arc::new(TargetedSweepMetrics::new()),
            config(0, 0),
        )
        .unwrap();
        assert_eq!(background.worker_count(), 0);
    }
}
