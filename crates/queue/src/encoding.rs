//! Persisted key layouts of the sweep queue tables
//!
//! All queue state lives in three tables of the same key-value store:
//!
//! ```text
//! sweep.sweepableTimestamps
//!   row    [shard u32][strategy u8][coarse partition i64]
//!   column [fine partition i64]
//!
//! sweep.sweepableCells
//!   inline row     [shard u32][strategy u8][fine partition i64][0x00]
//!     column       [start ts i64][write id i64]
//!   dedicated row  [shard u32][strategy u8][fine partition i64][0x01][start ts i64][row number i64]
//!     column       [write id i64]
//!
//! sweep.progress
//!   row    [shard u32][strategy u8]  or  "number_of_shards"
//!   column "v"
//! ```
//!
//! Integers are big-endian; signed integers have their sign bit flipped so
//! byte order matches numeric order and row/column range scans come back
//! sorted by timestamp.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use tsweep_core::{next_lexicographic, Error, Result, ShardAndStrategy, TableRef, WriteReference};

/// Table indexing which fine partitions hold candidates
pub const SWEEPABLE_TIMESTAMPS_TABLE: &str = "sweep.sweepableTimestamps";
/// Table holding the candidate writes of each fine partition
pub const SWEEPABLE_CELLS_TABLE: &str = "sweep.sweepableCells";
/// Table holding progress cursors and the shard count
pub const SWEEP_PROGRESS_TABLE: &str = "sweep.progress";

const INLINE_MARKER: u8 = 0;
const DEDICATED_MARKER: u8 = 1;
const WRITE_ID_SEED: u64 = 0x5357_4545_50;

/// Reference to `sweep.sweepableTimestamps`
pub fn sweepable_timestamps_table() -> TableRef {
    TableRef::new(SWEEPABLE_TIMESTAMPS_TABLE)
}

/// Reference to `sweep.sweepableCells`
pub fn sweepable_cells_table() -> TableRef {
    TableRef::new(SWEEPABLE_CELLS_TABLE)
}

/// Reference to `sweep.progress`
pub fn sweep_progress_table() -> TableRef {
    TableRef::new(SWEEP_PROGRESS_TABLE)
}

// ============================================================================
// Primitive encodings
// ============================================================================

/// Order-preserving encoding of a signed integer
#[inline]
pub fn encode_ordered_i64(value: i64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, (value as u64) ^ (1 << 63));
    buf
}

/// Inverse of [`encode_ordered_i64`]
pub fn decode_ordered_i64(bytes: &[u8]) -> Result<i64> {
    if bytes.len() != 8 {
        return Err(Error::Serialization(format!(
            "expected 8 bytes for an ordered integer, got {}",
            bytes.len()
        )));
    }
    Ok((BigEndian::read_u64(bytes) ^ (1 << 63)) as i64)
}

/// Plain big-endian value encoding used for progress cells
pub fn encode_value(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Inverse of [`encode_value`]
pub fn decode_value(bytes: &[u8]) -> Result<i64> {
    Cursor::new(bytes)
        .read_i64::<BigEndian>()
        .map_err(|e| Error::Serialization(format!("malformed progress value: {e}")))
}

/// Stable id of a write within its start timestamp
///
/// Re-enqueuing the same write maps onto the same queue column, so enqueue
/// is idempotent. Always non-negative; negative ids mark dedicated row
/// references.
pub fn write_id(write_ref: &WriteReference) -> i64 {
    let mut buf = Vec::with_capacity(
        write_ref.table.name().len() + write_ref.cell.row().len() + write_ref.cell.column().len() + 13,
    );
    for part in [
        write_ref.table.name().as_bytes(),
        write_ref.cell.row(),
        write_ref.cell.column(),
    ] {
        // Writing into a Vec cannot fail
        let _ = buf.write_u32::<BigEndian>(part.len() as u32);
        buf.extend_from_slice(part);
    }
    buf.push(u8::from(write_ref.is_tombstone));
    (xxh3_64_with_seed(&buf, WRITE_ID_SEED) >> 1) as i64
}

/// Serialize a write reference as a queue value
pub fn serialize_write_reference(write_ref: &WriteReference) -> Result<Vec<u8>> {
    rmp_serde::to_vec(write_ref).map_err(|e| Error::Serialization(e.to_string()))
}

/// Deserialize a queue value
pub fn deserialize_write_reference(bytes: &[u8]) -> Result<WriteReference> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
}

// ============================================================================
// Row and column layouts
// ============================================================================

/// `[shard][strategy]`, the prefix shared by every row of one queue
pub fn shard_strategy_prefix(ss: ShardAndStrategy) -> Vec<u8> {
    let mut row = Vec::with_capacity(32);
    row.extend_from_slice(&ss.shard.to_be_bytes());
    row.push(ss.strategy.as_byte());
    row
}

/// Row of `sweep.sweepableTimestamps`
pub fn sweepable_timestamps_row(ss: ShardAndStrategy, coarse: i64) -> Vec<u8> {
    let mut row = shard_strategy_prefix(ss);
    row.extend_from_slice(&encode_ordered_i64(coarse));
    row
}

/// Column of `sweep.sweepableTimestamps`
pub fn sweepable_timestamps_column(fine: i64) -> Vec<u8> {
    encode_ordered_i64(fine).to_vec()
}

/// Fine partition stored in a `sweep.sweepableTimestamps` column
pub fn decode_sweepable_timestamps_column(column: &[u8]) -> Result<i64> {
    decode_ordered_i64(column)
}

/// `[shard][strategy][fine]`, the prefix of every cells row of a fine partition
pub fn partition_prefix(ss: ShardAndStrategy, fine: i64) -> Vec<u8> {
    let mut row = shard_strategy_prefix(ss);
    row.extend_from_slice(&encode_ordered_i64(fine));
    row
}

/// Inline row of `sweep.sweepableCells`
pub fn inline_cells_row(ss: ShardAndStrategy, fine: i64) -> Vec<u8> {
    let mut row = partition_prefix(ss, fine);
    row.push(INLINE_MARKER);
    row
}

/// Dedicated row of `sweep.sweepableCells`
pub fn dedicated_cells_row(ss: ShardAndStrategy, fine: i64, start_ts: i64, row_number: i64) -> Vec<u8> {
    let mut row = partition_prefix(ss, fine);
    row.push(DEDICATED_MARKER);
    row.extend_from_slice(&encode_ordered_i64(start_ts));
    row.extend_from_slice(&encode_ordered_i64(row_number));
    row
}

/// Prefix of every dedicated row for one start timestamp
pub fn dedicated_rows_prefix(ss: ShardAndStrategy, fine: i64, start_ts: i64) -> Vec<u8> {
    let mut row = partition_prefix(ss, fine);
    row.push(DEDICATED_MARKER);
    row.extend_from_slice(&encode_ordered_i64(start_ts));
    row
}

/// Inline column `[start ts][write id]`
pub fn inline_cells_column(start_ts: i64, write_id: i64) -> Vec<u8> {
    let mut column = Vec::with_capacity(16);
    column.extend_from_slice(&encode_ordered_i64(start_ts));
    column.extend_from_slice(&encode_ordered_i64(write_id));
    column
}

/// Decode an inline column into `(start ts, write id)`
pub fn decode_inline_cells_column(column: &[u8]) -> Result<(i64, i64)> {
    if column.len() != 16 {
        return Err(Error::Serialization(format!(
            "expected 16 byte sweepable cells column, got {}",
            column.len()
        )));
    }
    Ok((decode_ordered_i64(&column[..8])?, decode_ordered_i64(&column[8..])?))
}

/// First inline column at or after `start_ts`
pub fn inline_column_lower_bound(start_ts: i64) -> Vec<u8> {
    encode_ordered_i64(start_ts).to_vec()
}

/// First inline column after every column of `start_ts`
pub fn inline_column_upper_bound(start_ts: i64) -> Option<Vec<u8>> {
    next_lexicographic(&encode_ordered_i64(start_ts))
}

/// Dedicated column `[write id]`
pub fn dedicated_cells_column(write_id: i64) -> Vec<u8> {
    encode_ordered_i64(write_id).to_vec()
}

/// Row of a progress cursor
pub fn progress_row(ss: ShardAndStrategy) -> Vec<u8> {
    shard_strategy_prefix(ss)
}

/// Row holding the persisted shard count
pub fn shard_count_row() -> Vec<u8> {
    b"number_of_shards".to_vec()
}

/// Single column used by progress rows
pub fn progress_column() -> Vec<u8> {
    b"v".to_vec()
}
