//! Applies a sweep batch to the key-value store
//!
//! For every table touched by a batch, history below the newest swept write
//! of each cell is removed in chunks of `BATCH_SIZE_KVS` cells. Conservative
//! sweep writes a sentinel for each chunk before deleting and keeps existing
//! sentinels; thorough sweep deletes sentinels with the rest. Writes of
//! aborted transactions are removed version by version. The follower runs
//! once per table after that table's deletes are applied.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use tsweep_core::{Cell, KeyValueService, Result, SweepStrategy, TableRef, TargetedSweepFollower, WriteInfo};

use crate::partitioning::BATCH_SIZE_KVS;

/// Physical deletes for one sweep strategy
pub struct SweepDeleter {
    kvs: Arc<dyn KeyValueService>,
    follower: Arc<dyn TargetedSweepFollower>,
}

impl SweepDeleter {
    /// Deleter writing to `kvs` and notifying `follower`
    pub fn new(kvs: Arc<dyn KeyValueService>, follower: Arc<dyn TargetedSweepFollower>) -> Self {
        Self { kvs, follower }
    }

    /// Remove the history below each committed write
    ///
    /// Returns the number of sentinels written.
    pub fn sweep(&self, writes: &[WriteInfo], strategy: SweepStrategy) -> Result<u64> {
        let mut by_table: BTreeMap<&TableRef, BTreeMap<Cell, i64>> = BTreeMap::new();
        for write in writes {
            by_table
                .entry(write.table())
                .or_default()
                .insert(write.cell().clone(), write.timestamp_to_delete_at_exclusive(strategy));
        }

        let mut sentinels = 0u64;
        for (table, bounds) in by_table {
            let entries: Vec<(Cell, i64)> = bounds.into_iter().collect();
            for chunk in entries.chunks(BATCH_SIZE_KVS) {
                let chunk_bounds: BTreeMap<Cell, i64> = chunk.iter().cloned().collect();
                if strategy.should_add_sentinels() {
                    let cells: BTreeSet<Cell> = chunk_bounds.keys().cloned().collect();
                    self.kvs.add_garbage_collection_sentinel_values(table, &cells)?;
                    sentinels += cells.len() as u64;
                    self.kvs.delete_all_timestamps(table, &chunk_bounds, false)?;
                } else {
                    self.kvs.delete_all_timestamps(table, &chunk_bounds, true)?;
                }
            }

            let cells: BTreeSet<Cell> = entries.into_iter().map(|(cell, _)| cell).collect();
            debug!(target: "tsweep::sweep", %table, %strategy, cells = cells.len(), "Swept table");
            self.follower.run(table, &cells);
        }
        Ok(sentinels)
    }

    /// Remove exactly the versions written by aborted transactions
    ///
    /// Returns the number of versions removed.
    pub fn delete_aborted(&self, aborted: &[WriteInfo]) -> Result<u64> {
        let mut by_table: BTreeMap<&TableRef, BTreeMap<Cell, BTreeSet<i64>>> = BTreeMap::new();
        for write in aborted {
            by_table
                .entry(write.table())
                .or_default()
                .entry(write.cell().clone())
                .or_default()
                .insert(write.timestamp);
        }

        let mut deleted = 0u64;
        for (table, versions) in by_table {
            let entries: Vec<(Cell, BTreeSet<i64>)> = versions.into_iter().collect();
            for chunk in entries.chunks(BATCH_SIZE_KVS) {
                let chunk_versions: BTreeMap<Cell, BTreeSet<i64>> = chunk.iter().cloned().collect();
                deleted += chunk_versions.values().map(|ts| ts.len() as u64).sum::<u64>();
                self.kvs.delete(table, &chunk_versions)?;
            }
        }
        Ok(deleted)
    }
}
