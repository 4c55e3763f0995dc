//! Routes writes to the queue of their (shard, strategy)
//!
//! The sweep strategy of a table comes from its metadata in the key-value
//! store and is cached for the life of the partitioner. Writes to tables
//! that are never swept are dropped here.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

use tsweep_core::{
    KeyValueService, Result, ShardAndStrategy, SweepStrategy, TableRef, TableSweepStrategy, WriteInfo,
};

/// Groups writes by the queue they belong to
pub struct WriteInfoPartitioner {
    kvs: Arc<dyn KeyValueService>,
    strategies: DashMap<TableRef, TableSweepStrategy>,
}

impl WriteInfoPartitioner {
    /// Partitioner reading table metadata from `kvs`
    pub fn new(kvs: Arc<dyn KeyValueService>) -> Self {
        Self {
            kvs,
            strategies: DashMap::new(),
        }
    }

    /// Sweep strategy of `table`, `None` if it is never swept
    ///
    /// Unknown tables are swept conservatively.
    pub fn get_strategy(&self, table: &TableRef) -> Result<Option<SweepStrategy>> {
        if let Some(cached) = self.strategies.get(table) {
            return Ok(SweepStrategy::for_table(*cached));
        }
        let strategy = self
            .kvs
            .get_metadata_for_table(table)?
            .map(|metadata| metadata.sweep_strategy)
            .unwrap_or_default();
        self.strategies.insert(table.clone(), strategy);
        Ok(SweepStrategy::for_table(strategy))
    }

    /// Writes of swept tables grouped by queue, for `shards` shards
    pub fn partition_writes_by_shard_strategy(
        &self,
        writes: &[WriteInfo],
        shards: u32,
    ) -> Result<BTreeMap<ShardAndStrategy, Vec<WriteInfo>>> {
        let mut partitioned: BTreeMap<ShardAndStrategy, Vec<WriteInfo>> = BTreeMap::new();
        for write in writes {
            if let Some(strategy) = self.get_strategy(write.table())? {
                let ss = ShardAndStrategy::new(write.to_shard(shards), strategy);
                partitioned.entry(ss).or_default().push(write.clone());
            }
        }
        Ok(partitioned)
    }
}
