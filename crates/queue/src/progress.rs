//! Persisted sweep progress and shard count
//!
//! Both values only ever increase. Updates are compare-and-set loops against
//! the current stored value, so concurrent writers from any number of
//! processes converge on the maximum requested value.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use tsweep_core::{
    Cell, CheckAndSetRequest, Error, KeyValueService, Result, ShardAndStrategy, TableRef,
};

use crate::encoding::{
    decode_value, encode_value, progress_column, progress_row, shard_count_row, sweep_progress_table,
};
use crate::partitioning::{DEFAULT_SHARDS, INITIAL_TIMESTAMP, MAX_SHARDS};
use crate::sweepable_timestamps::QUEUE_READ_TIMESTAMP;

/// Durable per-queue sweep cursors
pub struct ShardProgress {
    kvs: Arc<dyn KeyValueService>,
    table: TableRef,
}

impl ShardProgress {
    /// Progress tracker backed by `kvs`
    pub fn new(kvs: Arc<dyn KeyValueService>) -> Self {
        Self {
            kvs,
            table: sweep_progress_table(),
        }
    }

    /// Last timestamp fully swept for `ss`, `INITIAL_TIMESTAMP` if never swept
    pub fn get_last_swept_timestamp(&self, ss: ShardAndStrategy) -> Result<i64> {
        Ok(self
            .read(&progress_row(ss))?
            .map(|bytes| decode_value(&bytes))
            .transpose()?
            .unwrap_or(INITIAL_TIMESTAMP))
    }

    /// Move the cursor of `ss` to `timestamp` unless it is already at or past it
    ///
    /// Returns the stored value after the update.
    pub fn update_last_swept_timestamp(&self, ss: ShardAndStrategy, timestamp: i64) -> Result<i64> {
        self.increase_value_to_at_least(&progress_row(ss), timestamp, INITIAL_TIMESTAMP)
    }

    /// Persisted shard count, never below `DEFAULT_SHARDS`
    pub fn get_number_of_shards(&self) -> Result<u32> {
        let stored = self
            .read(&shard_count_row())?
            .map(|bytes| decode_value(&bytes))
            .transpose()?
            .unwrap_or(i64::from(DEFAULT_SHARDS));
        Ok(clamp_shards(stored).max(DEFAULT_SHARDS))
    }

    /// Raise the persisted shard count to `shards`
    ///
    /// Returns the stored count afterwards, which is the maximum of every
    /// value ever requested. Counts outside `1..=MAX_SHARDS` are rejected.
    pub fn update_number_of_shards(&self, shards: u32) -> Result<u32> {
        if shards == 0 || shards > MAX_SHARDS {
            return Err(Error::InvalidConfiguration(format!(
                "number of shards must be between 1 and {MAX_SHARDS}, got {shards}"
            )));
        }
        let stored =
            self.increase_value_to_at_least(&shard_count_row(), i64::from(shards), i64::from(DEFAULT_SHARDS))?;
        Ok(clamp_shards(stored))
    }

    fn read(&self, row: &[u8]) -> Result<Option<Vec<u8>>> {
        let cell = Cell::new(row.to_vec(), progress_column());
        let mut request = BTreeMap::new();
        request.insert(cell.clone(), QUEUE_READ_TIMESTAMP);
        Ok(self
            .kvs
            .get(&self.table, &request)?
            .remove(&cell)
            .map(|value| value.into_contents()))
    }

    fn increase_value_to_at_least(&self, row: &[u8], target: i64, default: i64) -> Result<i64> {
        let cell = Cell::new(row.to_vec(), progress_column());
        loop {
            let current = self.read(row)?;
            let current_value = match &current {
                Some(bytes) => decode_value(bytes)?,
                None => default,
            };
            if current_value >= target {
                return Ok(current_value);
            }

            let request = match current {
                Some(bytes) => {
                    CheckAndSetRequest::single_cell(self.table.clone(), cell.clone(), bytes, encode_value(target))
                }
                None => CheckAndSetRequest::new_cell(self.table.clone(), cell.clone(), encode_value(target)),
            };
            match self.kvs.check_and_set(&request) {
                Ok(()) => {
                    if row == shard_count_row().as_slice() {
                        info!(target: "tsweep::queue", shards = target, "Increased number of shards");
                    }
                    return Ok(target);
                }
                Err(Error::CheckAndSetFailed { .. }) => {
                    debug!(target: "tsweep::queue", target, "Lost progress update race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn clamp_shards(stored: i64) -> u32 {
    stored.clamp(0, i64::from(MAX_SHARDS)) as u32
}
