//! In-memory multi-version key-value store
//!
//! Tables are sharded through a DashMap; each table keeps its cells in an
//! ordered map so row and column range scans come back in key order.
//!
//! # Design
//!
//! - DashMap: one entry per table, tables never contend with each other
//! - BTreeMap<Cell, VersionChain>: ordered cells for range scans
//! - VersionChain: every version of a cell keyed by timestamp
//!
//! # Read semantics
//!
//! A read at timestamp `t` returns the newest version strictly below `t`.
//! The garbage collection sentinel lives at timestamp -1 and is therefore
//! visible to every read at `t >= 0` until a newer version exists.

use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::BuildHasherDefault;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use tsweep_core::{
    Cell, CheckAndSetRequest, ColumnRange, Error, KeyValueService, RangeRequest, Result,
    TableMetadata, TableRef, Value, SENTINEL_TIMESTAMP,
};

/// Timestamp at which conditional writes (check-and-set, put-unless-exists) land
const CONDITIONAL_WRITE_TIMESTAMP: i64 = 0;

/// Every version of a single cell, keyed by write timestamp
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: BTreeMap<i64, Vec<u8>>,
}

impl VersionChain {
    /// Write (or overwrite) the version at `timestamp`
    #[inline]
    pub fn put(&mut self, timestamp: i64, contents: Vec<u8>) {
        self.versions.insert(timestamp, contents);
    }

    /// Newest version strictly below `timestamp`
    pub fn get_below(&self, timestamp: i64) -> Option<Value> {
        self.versions
            .range(..timestamp)
            .next_back()
            .map(|(ts, contents)| Value::new(contents.clone(), *ts))
    }

    /// Contents stored at exactly `timestamp`
    pub fn get_exact(&self, timestamp: i64) -> Option<&Vec<u8>> {
        self.versions.get(&timestamp)
    }

    /// Remove the listed versions
    pub fn delete_versions(&mut self, timestamps: &BTreeSet<i64>) {
        for ts in timestamps {
            self.versions.remove(ts);
        }
    }

    /// Remove every version below `max_exclusive`, keeping the sentinel
    /// unless `include_sentinels` is set
    pub fn delete_below(&mut self, max_exclusive: i64, include_sentinels: bool) {
        self.versions.retain(|&ts, _| {
            ts >= max_exclusive || (!include_sentinels && ts == SENTINEL_TIMESTAMP)
        });
    }

    /// All timestamps present, oldest first
    pub fn timestamps(&self) -> Vec<i64> {
        self.versions.keys().copied().collect()
    }

    /// Number of versions stored
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Whether no version is left
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Cells of one table in (row, column) order
#[derive(Debug, Default)]
struct TableData {
    cells: BTreeMap<Cell, VersionChain>,
}

impl TableData {
    fn chain_mut(&mut self, cell: &Cell) -> &mut VersionChain {
        self.cells.entry(cell.clone()).or_default()
    }

    fn remove_empty(&mut self, cell: &Cell) {
        if self.cells.get(cell).map_or(false, VersionChain::is_empty) {
            self.cells.remove(cell);
        }
    }

    fn cells_in_range<'a>(
        &'a self,
        range: &'a RangeRequest,
    ) -> impl Iterator<Item = (&'a Cell, &'a VersionChain)> + 'a {
        let start = match &range.start_row {
            Some(row) => Bound::Included(Cell::new(row.clone(), Vec::new())),
            None => Bound::Unbounded,
        };
        self.cells
            .range((start, Bound::Unbounded))
            .take_while(move |(cell, _)| {
                range.end_row.as_deref().map_or(true, |end| cell.row() < end)
            })
            .filter(move |(cell, _)| range.columns.contains(cell.column()))
    }
}

type TableMap = DashMap<TableRef, Arc<RwLock<TableData>>, BuildHasherDefault<FxHasher>>;

/// In-memory `KeyValueService`
///
/// # Thread Safety
///
/// All operations are thread-safe. Each call takes the target table's lock
/// once, so a single call is atomic with respect to other calls on the same
/// table; calls on different tables never contend.
///
/// # Example
///
/// ```ignore
/// use tsweep_storage::InMemoryKeyValueService;
///
/// let kvs = InMemoryKeyValueService::new();
/// kvs.put(&table, &values, 10)?;
/// let visible = kvs.get(&table, &reads)?;
/// ```
pub struct InMemoryKeyValueService {
    tables: TableMap,
    metadata: DashMap<TableRef, TableMetadata>,
    initialized: AtomicBool,
}

impl InMemoryKeyValueService {
    /// Create an empty, initialized store
    pub fn new() -> Self {
        Self {
            tables: DashMap::with_hasher(BuildHasherDefault::default()),
            metadata: DashMap::new(),
            initialized: AtomicBool::new(true),
        }
    }

    /// Create an empty store that reports itself as not yet initialized
    pub fn uninitialized() -> Self {
        let kvs = Self::new();
        kvs.set_initialized(false);
        kvs
    }

    /// Flip the readiness flag
    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }

    /// Timestamps of every version stored for a cell, oldest first
    pub fn get_all_timestamps(&self, table: &TableRef, cell: &Cell) -> Vec<i64> {
        self.existing(table)
            .and_then(|data| data.read().cells.get(cell).map(VersionChain::timestamps))
            .unwrap_or_default()
    }

    /// Number of cells holding at least one version
    pub fn cell_count(&self, table: &TableRef) -> usize {
        self.existing(table)
            .map(|data| data.read().cells.len())
            .unwrap_or(0)
    }

    fn existing(&self, table: &TableRef) -> Option<Arc<RwLock<TableData>>> {
        self.tables.get(table).map(|entry| Arc::clone(entry.value()))
    }

    fn table(&self, table: &TableRef) -> Arc<RwLock<TableData>> {
        if let Some(existing) = self.existing(table) {
            return existing;
        }
        Arc::clone(self.tables.entry(table.clone()).or_default().value())
    }
}

impl Default for InMemoryKeyValueService {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueService for InMemoryKeyValueService {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn create_table(&self, table: &TableRef, metadata: TableMetadata) -> Result<()> {
        self.table(table);
        self.metadata.insert(table.clone(), metadata);
        debug!(target: "tsweep::storage", %table, strategy = ?metadata.sweep_strategy, "Created table");
        Ok(())
    }

    fn get_metadata_for_table(&self, table: &TableRef) -> Result<Option<TableMetadata>> {
        Ok(self.metadata.get(table).map(|entry| *entry.value()))
    }

    fn put(&self, table: &TableRef, values: &BTreeMap<Cell, Vec<u8>>, timestamp: i64) -> Result<()> {
        let data = self.table(table);
        let mut data = data.write();
        for (cell, contents) in values {
            data.chain_mut(cell).put(timestamp, contents.clone());
        }
        Ok(())
    }

    fn put_unless_exists(&self, table: &TableRef, values: &BTreeMap<Cell, Vec<u8>>) -> Result<()> {
        let data = self.table(table);
        let mut data = data.write();
        if values.keys().any(|cell| data.cells.contains_key(cell)) {
            return Err(Error::KeyAlreadyExists {
                table: table.clone(),
            });
        }
        for (cell, contents) in values {
            data.chain_mut(cell)
                .put(CONDITIONAL_WRITE_TIMESTAMP, contents.clone());
        }
        Ok(())
    }

    fn check_and_set(&self, request: &CheckAndSetRequest) -> Result<()> {
        let data = self.table(&request.table);
        let mut data = data.write();
        let current = data
            .cells
            .get(&request.cell)
            .and_then(|chain| chain.get_exact(CONDITIONAL_WRITE_TIMESTAMP))
            .cloned();
        if current != request.expected {
            trace!(target: "tsweep::storage", table = %request.table, "Check-and-set lost");
            return Err(Error::CheckAndSetFailed {
                table: request.table.clone(),
                current,
            });
        }
        data.chain_mut(&request.cell)
            .put(CONDITIONAL_WRITE_TIMESTAMP, request.new_value.clone());
        Ok(())
    }

    fn get(&self, table: &TableRef, timestamp_by_cell: &BTreeMap<Cell, i64>) -> Result<BTreeMap<Cell, Value>> {
        let Some(data) = self.existing(table) else {
            return Ok(BTreeMap::new());
        };
        let data = data.read();
        Ok(timestamp_by_cell
            .iter()
            .filter_map(|(cell, &ts)| {
                data.cells
                    .get(cell)
                    .and_then(|chain| chain.get_below(ts))
                    .map(|value| (cell.clone(), value))
            })
            .collect())
    }

    fn get_row_column_range(
        &self,
        table: &TableRef,
        row: &[u8],
        columns: &ColumnRange,
        timestamp: i64,
        max_cells: Option<usize>,
    ) -> Result<Vec<(Cell, Value)>> {
        let Some(data) = self.existing(table) else {
            return Ok(Vec::new());
        };
        let mut end_row = row.to_vec();
        end_row.push(0);
        let range = RangeRequest {
            start_row: Some(row.to_vec()),
            end_row: Some(end_row),
            columns: columns.clone(),
        };
        let data = data.read();
        Ok(data
            .cells_in_range(&range)
            .filter_map(|(cell, chain)| chain.get_below(timestamp).map(|v| (cell.clone(), v)))
            .take(max_cells.unwrap_or(usize::MAX))
            .collect())
    }

    fn get_range(&self, table: &TableRef, range: &RangeRequest, timestamp: i64) -> Result<Vec<(Cell, Value)>> {
        let Some(data) = self.existing(table) else {
            return Ok(Vec::new());
        };
        let data = data.read();
        Ok(data
            .cells_in_range(range)
            .filter_map(|(cell, chain)| chain.get_below(timestamp).map(|v| (cell.clone(), v)))
            .collect())
    }

    fn delete(&self, table: &TableRef, versions: &BTreeMap<Cell, BTreeSet<i64>>) -> Result<()> {
        let Some(data) = self.existing(table) else {
            return Ok(());
        };
        let mut data = data.write();
        for (cell, timestamps) in versions {
            if let Some(chain) = data.cells.get_mut(cell) {
                chain.delete_versions(timestamps);
            }
            data.remove_empty(cell);
        }
        Ok(())
    }

    fn delete_rows(&self, table: &TableRef, rows: &[Vec<u8>]) -> Result<()> {
        let Some(data) = self.existing(table) else {
            return Ok(());
        };
        let rows: BTreeSet<&[u8]> = rows.iter().map(Vec::as_slice).collect();
        data.write().cells.retain(|cell, _| !rows.contains(&cell.row()));
        Ok(())
    }

    fn delete_range(&self, table: &TableRef, range: &RangeRequest) -> Result<()> {
        let Some(data) = self.existing(table) else {
            return Ok(());
        };
        let mut data = data.write();
        let doomed: Vec<Cell> = data
            .cells_in_range(range)
            .map(|(cell, _)| cell.clone())
            .collect();
        for cell in doomed {
            data.cells.remove(&cell);
        }
        Ok(())
    }

    fn delete_all_timestamps(
        &self,
        table: &TableRef,
        max_timestamp_exclusive_by_cell: &BTreeMap<Cell, i64>,
        include_sentinels: bool,
    ) -> Result<()> {
        let Some(data) = self.existing(table) else {
            return Ok(());
        };
        let mut data = data.write();
        for (cell, &max_exclusive) in max_timestamp_exclusive_by_cell {
            if let Some(chain) = data.cells.get_mut(cell) {
                chain.delete_below(max_exclusive, include_sentinels);
            }
            data.remove_empty(cell);
        }
        Ok(())
    }

    fn add_garbage_collection_sentinel_values(&self, table: &TableRef, cells: &BTreeSet<Cell>) -> Result<()> {
        let data = self.table(table);
        let mut data = data.write();
        for cell in cells {
            data.chain_mut(cell).put(SENTINEL_TIMESTAMP, Vec::new());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsweep_core::TableSweepStrategy;

    fn table() -> TableRef {
        TableRef::new("test.table")
    }

    fn cell(row: &[u8], col: &[u8]) -> Cell {
        Cell::new(row.to_vec(), col.to_vec())
    }

    fn put_one(kvs: &InMemoryKeyValueService, c: &Cell, contents: &[u8], ts: i64) {
        let mut values = BTreeMap::new();
        values.insert(c.clone(), contents.to_vec());
        kvs.put(&table(), &values, ts).unwrap();
    }

    fn read_at(kvs: &InMemoryKeyValueService, c: &Cell, ts: i64) -> Option<Value> {
        let mut reads = BTreeMap::new();
        reads.insert(c.clone(), ts);
        kvs.get(&table(), &reads).unwrap().remove(c)
    }

    #[test]
    fn test_read_sees_newest_version_strictly_below() {
        let kvs = InMemoryKeyValueService::new();
        let c = cell(b"r", b"c");
        put_one(&kvs, &c, b"ten", 10);
        put_one(&kvs, &c, b"twenty", 20);

        assert_eq!(read_at(&kvs, &c, 10), None);
        assert_eq!(read_at(&kvs, &c, 11).unwrap().timestamp(), 10);
        assert_eq!(read_at(&kvs, &c, 20).unwrap().contents(), b"ten");
        assert_eq!(read_at(&kvs, &c, 21).unwrap().contents(), b"twenty");
    }

    #[test]
    fn test_sentinel_visible_from_zero() {
        let kvs = InMemoryKeyValueService::new();
        let c = cell(b"r", b"c");
        kvs.add_garbage_collection_sentinel_values(&table(), &[c.clone()].into_iter().collect())
            .unwrap();

        assert_eq!(read_at(&kvs, &c, -1), None);
        assert!(read_at(&kvs, &c, 0).unwrap().is_sentinel());
    }

    #[test]
    fn test_delete_all_timestamps_keeps_sentinel_unless_asked() {
        let kvs = InMemoryKeyValueService::new();
        let c = cell(b"r", b"c");
        kvs.add_garbage_collection_sentinel_values(&table(), &[c.clone()].into_iter().collect())
            .unwrap();
        put_one(&kvs, &c, b"a", 5);
        put_one(&kvs, &c, b"b", 7);

        let bounds: BTreeMap<Cell, i64> = [(c.clone(), 7)].into_iter().collect();
        kvs.delete_all_timestamps(&table(), &bounds, false).unwrap();
        assert_eq!(kvs.get_all_timestamps(&table(), &c), vec![-1, 7]);

        kvs.delete_all_timestamps(&table(), &bounds, true).unwrap();
        assert_eq!(kvs.get_all_timestamps(&table(), &c), vec![7]);
    }

    #[test]
    fn test_delete_removes_only_listed_versions() {
        let kvs = InMemoryKeyValueService::new();
        let c = cell(b"r", b"c");
        put_one(&kvs, &c, b"a", 5);
        put_one(&kvs, &c, b"b", 7);

        let versions: BTreeMap<Cell, BTreeSet<i64>> =
            [(c.clone(), [5].into_iter().collect())].into_iter().collect();
        kvs.delete(&table(), &versions).unwrap();
        assert_eq!(kvs.get_all_timestamps(&table(), &c), vec![7]);
    }

    #[test]
    fn test_check_and_set() {
        let kvs = InMemoryKeyValueService::new();
        let c = cell(b"progress", b"v");

        kvs.check_and_set(&CheckAndSetRequest::new_cell(table(), c.clone(), vec![1]))
            .unwrap();
        let err = kvs
            .check_and_set(&CheckAndSetRequest::new_cell(table(), c.clone(), vec![2]))
            .unwrap_err();
        assert!(matches!(err, Error::CheckAndSetFailed { current: Some(ref v), .. } if v == &vec![1]));

        kvs.check_and_set(&CheckAndSetRequest::single_cell(table(), c.clone(), vec![1], vec![3]))
            .unwrap();
        assert_eq!(read_at(&kvs, &c, i64::MAX).unwrap().contents(), &[3]);
    }

    #[test]
    fn test_put_unless_exists() {
        let kvs = InMemoryKeyValueService::new();
        let values: BTreeMap<Cell, Vec<u8>> = [(cell(b"r", b"c"), vec![1])].into_iter().collect();
        kvs.put_unless_exists(&table(), &values).unwrap();
        assert!(matches!(
            kvs.put_unless_exists(&table(), &values),
            Err(Error::KeyAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_row_column_range_is_ordered_and_bounded() {
        let kvs = InMemoryKeyValueService::new();
        for col in [5u8, 1, 3, 9] {
            put_one(&kvs, &cell(b"row", &[col]), &[col], 0);
        }
        put_one(&kvs, &cell(b"row2", &[2]), &[2], 0);

        let result = kvs
            .get_row_column_range(&table(), b"row", &ColumnRange::between(vec![2], vec![9]), i64::MAX, None)
            .unwrap();
        let cols: Vec<u8> = result.iter().map(|(c, _)| c.column()[0]).collect();
        assert_eq!(cols, vec![3, 5]);
    }

    #[test]
    fn test_row_column_range_respects_max_cells() {
        let kvs = InMemoryKeyValueService::new();
        for col in [1u8, 2, 3, 4] {
            put_one(&kvs, &cell(b"row", &[col]), &[col], 0);
        }
        // Not visible below the read timestamp, so it does not count
        put_one(&kvs, &cell(b"row", &[0]), &[0], 100);

        let result = kvs
            .get_row_column_range(&table(), b"row", &ColumnRange::all(), 50, Some(2))
            .unwrap();
        let cols: Vec<u8> = result.iter().map(|(c, _)| c.column()[0]).collect();
        assert_eq!(cols, vec![1, 2]);
    }

    #[test]
    fn test_prefix_range_scan_and_delete() {
        let kvs = InMemoryKeyValueService::new();
        put_one(&kvs, &cell(&[1, 1], b"a"), b"x", 0);
        put_one(&kvs, &cell(&[1, 2], b"a"), b"x", 0);
        put_one(&kvs, &cell(&[2, 0], b"a"), b"x", 0);

        let range = RangeRequest::prefix(&[1]);
        assert_eq!(kvs.get_range(&table(), &range, i64::MAX).unwrap().len(), 2);

        kvs.delete_range(&table(), &range).unwrap();
        assert_eq!(kvs.cell_count(&table()), 1);
    }

    #[test]
    fn test_delete_rows() {
        let kvs = InMemoryKeyValueService::new();
        put_one(&kvs, &cell(b"a", b"1"), b"x", 0);
        put_one(&kvs, &cell(b"a", b"2"), b"x", 0);
        put_one(&kvs, &cell(b"b", b"1"), b"x", 0);

        kvs.delete_rows(&table(), &[b"a".to_vec()]).unwrap();
        assert_eq!(kvs.cell_count(&table()), 1);
    }

    #[test]
    fn test_metadata_and_initialization() {
        let kvs = InMemoryKeyValueService::uninitialized();
        assert!(!kvs.is_initialized());
        kvs.set_initialized(true);
        assert!(kvs.is_initialized());

        assert_eq!(kvs.get_metadata_for_table(&table()).unwrap(), None);
        kvs.create_table(&table(), TableMetadata::with_sweep_strategy(TableSweepStrategy::Thorough))
            .unwrap();
        assert_eq!(
            kvs.get_metadata_for_table(&table()).unwrap().unwrap().sweep_strategy,
            TableSweepStrategy::Thorough
        );
    }
}
