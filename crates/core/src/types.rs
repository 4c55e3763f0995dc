//! Storage-level types: tables, cells and versioned values
//!
//! A cell is a (row, column) address within a table. Every write lands in a
//! cell at a timestamp; reads at timestamp `t` observe the newest version
//! strictly below `t`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp of the garbage collection sentinel.
///
/// A zero-length value at this timestamp marks "deleted before recorded history".
pub const SENTINEL_TIMESTAMP: i64 = -1;

/// Name of a table in the key-value store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef(String);

impl TableRef {
    /// Create a table reference from a fully qualified name (`namespace.table`)
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Fully qualified table name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (row, column) address within a table
///
/// Ordering is lexicographic by row, then column, which is the order range
/// scans return cells in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    row: Vec<u8>,
    column: Vec<u8>,
}

impl Cell {
    /// Create a cell from raw row and column names
    pub fn new(row: impl Into<Vec<u8>>, column: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            column: column.into(),
        }
    }

    /// Row name
    pub fn row(&self) -> &[u8] {
        &self.row
    }

    /// Column name
    pub fn column(&self) -> &[u8] {
        &self.column
    }
}

/// A value read from the store together with the timestamp it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    contents: Vec<u8>,
    timestamp: i64,
}

impl Value {
    /// Create a value
    pub fn new(contents: Vec<u8>, timestamp: i64) -> Self {
        Self {
            contents,
            timestamp,
        }
    }

    /// Raw contents; empty for tombstones and sentinels
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Consume the value and return its contents
    pub fn into_contents(self) -> Vec<u8> {
        self.contents
    }

    /// Timestamp the value was written at
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Whether this is the garbage collection sentinel
    pub fn is_sentinel(&self) -> bool {
        self.timestamp == SENTINEL_TIMESTAMP && self.contents.is_empty()
    }

    /// Whether this value records a logical deletion
    pub fn is_tombstone(&self) -> bool {
        self.contents.is_empty()
    }
}

/// Per-table sweep strategy as recorded in the table's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TableSweepStrategy {
    /// Never swept; writes are not enqueued at all
    Nothing,
    /// Swept leaving sentinels behind
    #[default]
    Conservative,
    /// Swept without sentinels
    Thorough,
}

/// Table metadata relevant to sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableMetadata {
    /// How writes to this table are cleaned up
    pub sweep_strategy: TableSweepStrategy,
}

impl TableMetadata {
    /// Metadata with the given sweep strategy
    pub fn with_sweep_strategy(sweep_strategy: TableSweepStrategy) -> Self {
        Self { sweep_strategy }
    }
}

/// Half-open column range `[start, end)`; `None` bounds are unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnRange {
    /// Inclusive lower bound
    pub start: Option<Vec<u8>>,
    /// Exclusive upper bound
    pub end: Option<Vec<u8>>,
}

impl ColumnRange {
    /// All columns
    pub fn all() -> Self {
        Self::default()
    }

    /// Columns in `[start, end)`
    pub fn between(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Whether `column` falls inside the range
    pub fn contains(&self, column: &[u8]) -> bool {
        self.start.as_deref().map_or(true, |s| column >= s)
            && self.end.as_deref().map_or(true, |e| column < e)
    }
}

/// Row range scan request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeRequest {
    /// Inclusive first row; `None` scans from the beginning
    pub start_row: Option<Vec<u8>>,
    /// Exclusive end row; `None` scans to the end
    pub end_row: Option<Vec<u8>>,
    /// Columns to return within each row
    pub columns: ColumnRange,
}

impl RangeRequest {
    /// Rows in `[start, end)` with all columns
    pub fn rows(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self {
            start_row: Some(start),
            end_row: Some(end),
            columns: ColumnRange::all(),
        }
    }

    /// Every row starting with `prefix`
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start_row: Some(prefix.to_vec()),
            end_row: next_lexicographic(prefix),
            columns: ColumnRange::all(),
        }
    }

    /// Restrict the columns returned per row
    pub fn with_columns(mut self, columns: ColumnRange) -> Self {
        self.columns = columns;
        self
    }

    /// Whether `row` falls inside the row range
    pub fn contains_row(&self, row: &[u8]) -> bool {
        self.start_row.as_deref().map_or(true, |s| row >= s)
            && self.end_row.as_deref().map_or(true, |e| row < e)
    }
}

/// Smallest byte string greater than every string starting with `prefix`.
///
/// Returns `None` when no such string exists (prefix is all `0xFF`).
pub fn next_lexicographic(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < u8::MAX {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

/// Conditional single-cell write, applied at timestamp 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckAndSetRequest {
    /// Target table
    pub table: TableRef,
    /// Target cell
    pub cell: Cell,
    /// Expected current value; `None` means the cell must be empty
    pub expected: Option<Vec<u8>>,
    /// Value to write on success
    pub new_value: Vec<u8>,
}

impl CheckAndSetRequest {
    /// Write `new_value` only if the cell holds no value yet
    pub fn new_cell(table: TableRef, cell: Cell, new_value: Vec<u8>) -> Self {
        Self {
            table,
            cell,
            expected: None,
            new_value,
        }
    }

    /// Replace `expected` with `new_value`
    pub fn single_cell(table: TableRef, cell: Cell, expected: Vec<u8>, new_value: Vec<u8>) -> Self {
        Self {
            table,
            cell,
            expected: Some(expected),
            new_value,
        }
    }
}
