//! Spying key-value store
//!
//! Delegates to an `InMemoryKeyValueService` and keeps a log of every mutating
//! call so tests can assert on exactly what the sweep engine asked the store
//! to do, not only on the resulting state.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use tsweep_core::{
    Cell, CheckAndSetRequest, ColumnRange, Error, KeyValueService, RangeRequest, Result,
    TableMetadata, TableRef, Value,
};

use crate::in_memory::InMemoryKeyValueService;

/// A mutating call made against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvsCall {
    /// `put`
    Put {
        /// Target table
        table: TableRef,
        /// Cells written
        cells: BTreeSet<Cell>,
        /// Write timestamp
        timestamp: i64,
    },
    /// `delete` of exact versions
    Delete {
        /// Target table
        table: TableRef,
        /// Versions removed per cell
        versions: BTreeMap<Cell, BTreeSet<i64>>,
    },
    /// `delete_all_timestamps`
    DeleteAllTimestamps {
        /// Target table
        table: TableRef,
        /// Exclusive upper bound per cell
        bounds: BTreeMap<Cell, i64>,
        /// Whether sentinels were removed too
        include_sentinels: bool,
    },
    /// `add_garbage_collection_sentinel_values`
    AddSentinels {
        /// Target table
        table: TableRef,
        /// Cells that received a sentinel
        cells: BTreeSet<Cell>,
    },
    /// `delete_rows`
    DeleteRows {
        /// Target table
        table: TableRef,
        /// Rows removed
        rows: Vec<Vec<u8>>,
    },
    /// `delete_range`
    DeleteRange {
        /// Target table
        table: TableRef,
        /// Range removed
        range: RangeRequest,
    },
}

impl KvsCall {
    /// Table the call targeted
    pub fn table(&self) -> &TableRef {
        match self {
            KvsCall::Put { table, .. }
            | KvsCall::Delete { table, .. }
            | KvsCall::DeleteAllTimestamps { table, .. }
            | KvsCall::AddSentinels { table, .. }
            | KvsCall::DeleteRows { table, .. }
            | KvsCall::DeleteRange { table, .. } => table,
        }
    }
}

/// In-memory store that records calls and can simulate an outage
pub struct RecordingKeyValueService {
    inner: InMemoryKeyValueService,
    calls: Mutex<Vec<KvsCall>>,
    fetched: Mutex<BTreeMap<TableRef, usize>>,
    unavailable: AtomicBool,
}

impl RecordingKeyValueService {
    /// Wrap a fresh, initialized in-memory store
    pub fn new() -> Self {
        Self::wrapping(InMemoryKeyValueService::new())
    }

    /// Wrap an existing store
    pub fn wrapping(inner: InMemoryKeyValueService) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fetched: Mutex::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &InMemoryKeyValueService {
        &self.inner
    }

    /// While set, every call fails with `UpstreamUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Every recorded call, oldest first
    pub fn calls(&self) -> Vec<KvsCall> {
        self.calls.lock().clone()
    }

    /// Recorded calls against one table
    pub fn calls_for(&self, table: &TableRef) -> Vec<KvsCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.table() == table)
            .cloned()
            .collect()
    }

    /// `(bounds, include_sentinels)` of every `delete_all_timestamps` call on `table`
    pub fn delete_all_timestamps_calls(&self, table: &TableRef) -> Vec<(BTreeMap<Cell, i64>, bool)> {
        self.calls_for(table)
            .into_iter()
            .filter_map(|call| match call {
                KvsCall::DeleteAllTimestamps {
                    bounds,
                    include_sentinels,
                    ..
                } => Some((bounds, include_sentinels)),
                _ => None,
            })
            .collect()
    }

    /// Cells of every sentinel write on `table`
    pub fn sentinel_calls(&self, table: &TableRef) -> Vec<BTreeSet<Cell>> {
        self.calls_for(table)
            .into_iter()
            .filter_map(|call| match call {
                KvsCall::AddSentinels { cells, .. } => Some(cells),
                _ => None,
            })
            .collect()
    }

    /// Versions of every exact `delete` call on `table`
    pub fn delete_calls(&self, table: &TableRef) -> Vec<BTreeMap<Cell, BTreeSet<i64>>> {
        self.calls_for(table)
            .into_iter()
            .filter_map(|call| match call {
                KvsCall::Delete { versions, .. } => Some(versions),
                _ => None,
            })
            .collect()
    }

    /// Number of cells range reads returned from `table`
    pub fn cells_fetched(&self, table: &TableRef) -> usize {
        self.fetched.lock().get(table).copied().unwrap_or(0)
    }

    /// Forget all recorded calls and fetch counts
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
        self.fetched.lock().clear();
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::UpstreamUnavailable(
                "key value service unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn count_fetched(&self, table: &TableRef, cells: usize) {
        *self.fetched.lock().entry(table.clone()).or_insert(0) += cells;
    }

    fn record(&self, call: KvsCall) {
        self.calls.lock().push(call);
    }
}

impl Default for RecordingKeyValueService {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueService for RecordingKeyValueService {
    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    fn create_table(&self, table: &TableRef, metadata: TableMetadata) -> Result<()> {
        self.check_available()?;
        self.inner.create_table(table, metadata)
    }

    fn get_metadata_for_table(&self, table: &TableRef) -> Result<Option<TableMetadata>> {
        self.check_available()?;
        self.inner.get_metadata_for_table(table)
    }

    fn put(&self, table: &TableRef, values: &BTreeMap<Cell, Vec<u8>>, timestamp: i64) -> Result<()> {
        self.check_available()?;
        self.record(KvsCall::Put {
            table: table.clone(),
            cells: values.keys().cloned().collect(),
            timestamp,
        });
        self.inner.put(table, values, timestamp)
    }

    fn put_unless_exists(&self, table: &TableRef, values: &BTreeMap<Cell, Vec<u8>>) -> Result<()> {
        self.check_available()?;
        self.inner.put_unless_exists(table, values)
    }

    fn check_and_set(&self, request: &CheckAndSetRequest) -> Result<()> {
        self.check_available()?;
        self.inner.check_and_set(request)
    }

    fn get(&self, table: &TableRef, timestamp_by_cell: &BTreeMap<Cell, i64>) -> Result<BTreeMap<Cell, Value>> {
        self.check_available()?;
        self.inner.get(table, timestamp_by_cell)
    }

    fn get_row_column_range(
        &self,
        table: &TableRef,
        row: &[u8],
        columns: &ColumnRange,
        timestamp: i64,
        max_cells: Option<usize>,
    ) -> Result<Vec<(Cell, Value)>> {
        self.check_available()?;
        let cells = self
            .inner
            .get_row_column_range(table, row, columns, timestamp, max_cells)?;
        self.count_fetched(table, cells.len());
        Ok(cells)
    }

    fn get_range(&self, table: &TableRef, range: &RangeRequest, timestamp: i64) -> Result<Vec<(Cell, Value)>> {
        self.check_available()?;
        let cells = self.inner.get_range(table, range, timestamp)?;
        self.count_fetched(table, cells.len());
        Ok(cells)
    }

    fn delete(&self, table: &TableRef, versions: &BTreeMap<Cell, BTreeSet<i64>>) -> Result<()> {
        self.check_available()?;
        self.record(KvsCall::Delete {
            table: table.clone(),
            versions: versions.clone(),
        });
        self.inner.delete(table, versions)
    }

    fn delete_rows(&self, table: &TableRef, rows: &[Vec<u8>]) -> Result<()> {
        self.check_available()?;
        self.record(KvsCall::DeleteRows {
            table: table.clone(),
            rows: rows.to_vec(),
        });
        self.inner.delete_rows(table, rows)
    }

    fn delete_range(&self, table: &TableRef, range: &RangeRequest) -> Result<()> {
        self.check_available()?;
        self.record(KvsCall::DeleteRange {
            table: table.clone(),
            range: range.clone(),
        });
        self.inner.delete_range(table, range)
    }

    fn delete_all_timestamps(
        &self,
        table: &TableRef,
        max_timestamp_exclusive_by_cell: &BTreeMap<Cell, i64>,
        include_sentinels: bool,
    ) -> Result<()> {
        self.check_available()?;
        self.record(KvsCall::DeleteAllTimestamps {
            table: table.clone(),
            bounds: max_timestamp_exclusive_by_cell.clone(),
            include_sentinels,
        });
        self.inner
            .delete_all_timestamps(table, max_timestamp_exclusive_by_cell, include_sentinels)
    }

    fn add_garbage_collection_sentinel_values(&self, table: &TableRef, cells: &BTreeSet<Cell>) -> Result<()> {
        self.check_available()?;
        self.record(KvsCall::AddSentinels {
            table: table.clone(),
            cells: cells.clone(),
        });
        self.inner.add_garbage_collection_sentinel_values(table, cells)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef::new("test.table")
    }

    #[test]
    fn test_records_mutations_in_order() {
        let kvs = RecordingKeyValueService::new();
        let cell = Cell::new(b"r".to_vec(), b"c".to_vec());
        let values: BTreeMap<Cell, Vec<u8>> = [(cell.clone(), vec![1])].into_iter().collect();
        let bounds: BTreeMap<Cell, i64> = [(cell.clone(), 10)].into_iter().collect();

        kvs.put(&table(), &values, 5).unwrap();
        kvs.delete_all_timestamps(&table(), &bounds, true).unwrap();

        let calls = kvs.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], KvsCall::Put { timestamp: 5, .. }));
        assert_eq!(kvs.delete_all_timestamps_calls(&table()), vec![(bounds, true)]);
        assert!(kvs.calls_for(&TableRef::new("other.table")).is_empty());
    }

    #[test]
    fn test_unavailable_fails_without_recording() {
        let kvs = RecordingKeyValueService::new();
        kvs.set_unavailable(true);
        let err = kvs
            .add_garbage_collection_sentinel_values(&table(), &BTreeSet::new())
            .unwrap_err();
        assert!(err.is_transient());
        assert!(kvs.calls().is_empty());

        kvs.set_unavailable(false);
        kvs.add_garbage_collection_sentinel_values(&table(), &BTreeSet::new())
            .unwrap();
        assert_eq!(kvs.sentinel_calls(&table()).len(), 1);
    }

    #[test]
    fn test_counts_cells_fetched_by_range_reads() {
        let kvs = RecordingKeyValueService::new();
        let values: BTreeMap<Cell, Vec<u8>> = (0u8..5)
            .map(|col| (Cell::new(b"r".to_vec(), vec![col]), vec![col]))
            .collect();
        kvs.put(&table(), &values, 0).unwrap();

        kvs.get_row_column_range(&table(), b"r", &ColumnRange::all(), 1, Some(3))
            .unwrap();
        assert_eq!(kvs.cells_fetched(&table()), 3);
        kvs.get_range(&table(), &RangeRequest::prefix(b"r"), 1).unwrap();
        assert_eq!(kvs.cells_fetched(&table()), 8);

        kvs.clear_calls();
        assert_eq!(kvs.cells_fetched(&table()), 0);
    }
}
