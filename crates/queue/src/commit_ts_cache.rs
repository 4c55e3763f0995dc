//! Cache of resolved commit outcomes
//!
//! Commit outcomes never change once written, so anything the transaction
//! table has answered can be remembered. Unknown (in-flight) start
//! timestamps are never cached. The cache is bounded; once full, the oldest
//! entries are evicted first.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tsweep_core::{CommitStatus, Result, TransactionService};

/// Default number of outcomes kept
pub const DEFAULT_CAPACITY: usize = 100_000;

#[derive(Default)]
struct CacheState {
    outcomes: FxHashMap<i64, CommitStatus>,
    insertion_order: VecDeque<i64>,
}

/// Read-through cache in front of the transaction table
pub struct CommitTsCache {
    transactions: Arc<dyn TransactionService>,
    state: Mutex<CacheState>,
    capacity: usize,
}

impl CommitTsCache {
    /// Cache with the default capacity
    pub fn new(transactions: Arc<dyn TransactionService>) -> Self {
        Self::with_capacity(transactions, DEFAULT_CAPACITY)
    }

    /// Cache holding at most `capacity` outcomes
    pub fn with_capacity(transactions: Arc<dyn TransactionService>, capacity: usize) -> Self {
        Self {
            transactions,
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Whether `start_ts` is already known to have committed at or after `sweep_ts`
    ///
    /// Only consults the cache; never calls the transaction table.
    pub fn is_known_committed_at_or_after(&self, start_ts: i64, sweep_ts: i64) -> bool {
        matches!(
            self.state.lock().outcomes.get(&start_ts),
            Some(CommitStatus::Committed(commit_ts)) if *commit_ts >= sweep_ts
        )
    }

    /// Outcomes for `start_timestamps`, asking the transaction table only for
    /// the ones not cached yet. Unknown start timestamps are absent.
    pub fn load(&self, start_timestamps: &BTreeSet<i64>) -> Result<HashMap<i64, CommitStatus>> {
        let mut result = HashMap::with_capacity(start_timestamps.len());
        let mut missing = BTreeSet::new();
        {
            let state = self.state.lock();
            for &start_ts in start_timestamps {
                match state.outcomes.get(&start_ts) {
                    Some(status) => {
                        result.insert(start_ts, *status);
                    }
                    None => {
                        missing.insert(start_ts);
                    }
                }
            }
        }
        if missing.is_empty() {
            return Ok(result);
        }

        let fetched = self.transactions.get_many(&missing)?;
        let mut state = self.state.lock();
        for (&start_ts, &status) in &fetched {
            if state.outcomes.insert(start_ts, status).is_none() {
                state.insertion_order.push_back(start_ts);
            }
        }
        while state.outcomes.len() > self.capacity {
            match state.insertion_order.pop_front() {
                Some(evicted) => {
                    state.outcomes.remove(&evicted);
                }
                None => break,
            }
        }
        drop(state);

        result.extend(fetched);
        Ok(result)
    }

    /// Number of cached outcomes
    pub fn len(&self) -> usize {
        self.state.lock().outcomes.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
