//! Candidate writes of each fine partition
//!
//! A start timestamp with at most `MAX_CELLS_GENERIC` writes keeps them
//! inline in the partition row. Larger transactions store a single reference
//! entry inline, whose negative write id records how many dedicated rows hold
//! the actual writes, so the reader never has to enumerate start timestamps
//! to find overflow rows.
//!
//! Reading a partition resolves every start timestamp against the
//! transaction table and stops at the first one that is not yet sweepable.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use tsweep_core::{
    Cell, ColumnRange, KeyValueService, RangeRequest, Result, ShardAndStrategy, TableRef,
    WriteClassification, WriteInfo, WriteReference,
};

use crate::batch::{DedicatedRows, SweepBatch};
use crate::commit_ts_cache::CommitTsCache;
use crate::encoding::{
    decode_inline_cells_column, dedicated_cells_column, dedicated_cells_row, dedicated_rows_prefix,
    deserialize_write_reference, inline_cells_column, inline_cells_row, inline_column_lower_bound,
    inline_column_upper_bound, partition_prefix, serialize_write_reference, sweepable_cells_table,
    write_id,
};
use crate::partitioning::{
    max_ts_for_fine_partition, min_ts_for_fine_partition, ts_partition_fine, MAX_CELLS_DEDICATED,
    MAX_CELLS_GENERIC, SWEEP_BATCH_SIZE,
};
use crate::sweepable_timestamps::{QUEUE_READ_TIMESTAMP, QUEUE_WRITE_TIMESTAMP};

/// Inline entries fetched per store read: a full batch, the rest of its last
/// start timestamp and one entry past it
const INLINE_PAGE_SIZE: usize = SWEEP_BATCH_SIZE + MAX_CELLS_GENERIC + 1;

/// One inline entry of a partition row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    /// A write stored inline
    Write {
        /// Start timestamp of the writing transaction
        start_ts: i64,
        /// The write
        write_ref: WriteReference,
    },
    /// Pointer to the dedicated rows of a large transaction
    Dedicated {
        /// Start timestamp of the writing transaction
        start_ts: i64,
        /// Number of dedicated rows
        rows: i64,
    },
}

impl QueueEntry {
    /// Start timestamp of the entry
    pub fn start_ts(&self) -> i64 {
        match self {
            QueueEntry::Write { start_ts, .. } | QueueEntry::Dedicated { start_ts, .. } => *start_ts,
        }
    }
}

/// Store of the sweepable cells table
pub struct SweepableCells {
    kvs: Arc<dyn KeyValueService>,
    commit_ts_cache: Arc<CommitTsCache>,
    table: TableRef,
}

impl SweepableCells {
    /// Store backed by `kvs`, resolving commits through `commit_ts_cache`
    pub fn new(kvs: Arc<dyn KeyValueService>, commit_ts_cache: Arc<CommitTsCache>) -> Self {
        Self {
            kvs,
            commit_ts_cache,
            table: sweepable_cells_table(),
        }
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Persist `writes` as candidates of `ss`
    pub fn enqueue(&self, ss: ShardAndStrategy, writes: &[WriteInfo]) -> Result<()> {
        let mut by_start_ts: BTreeMap<i64, BTreeMap<i64, &WriteReference>> = BTreeMap::new();
        for write in writes {
            by_start_ts
                .entry(write.timestamp)
                .or_default()
                .insert(write_id(&write.write_ref), &write.write_ref);
        }

        let mut values = BTreeMap::new();
        for (start_ts, refs) in by_start_ts {
            let fine = ts_partition_fine(start_ts);
            let row = inline_cells_row(ss, fine);
            if refs.len() <= MAX_CELLS_GENERIC {
                for (id, write_ref) in refs {
                    values.insert(
                        Cell::new(row.clone(), inline_cells_column(start_ts, id)),
                        serialize_write_reference(write_ref)?,
                    );
                }
                continue;
            }

            let refs: Vec<(i64, &WriteReference)> = refs.into_iter().collect();
            let rows = ((refs.len() + MAX_CELLS_DEDICATED - 1) / MAX_CELLS_DEDICATED) as i64;
            values.insert(
                Cell::new(row, inline_cells_column(start_ts, -rows)),
                serialize_write_reference(refs[0].1)?,
            );
            for (row_number, chunk) in refs.chunks(MAX_CELLS_DEDICATED).enumerate() {
                let dedicated_row = dedicated_cells_row(ss, fine, start_ts, row_number as i64);
                for (id, write_ref) in chunk {
                    values.insert(
                        Cell::new(dedicated_row.clone(), dedicated_cells_column(*id)),
                        serialize_write_reference(write_ref)?,
                    );
                }
            }
            debug!(target: "tsweep::queue", %ss, start_ts, writes = refs.len(), rows, "Enqueued dedicated rows");
        }

        if values.is_empty() {
            return Ok(());
        }
        self.kvs.put(&self.table, &values, QUEUE_WRITE_TIMESTAMP)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Inline entries of fine partition `fine` with start timestamps in
    /// `[lower_inclusive, upper_inclusive]`, in start timestamp order
    pub fn read_partition(
        &self,
        ss: ShardAndStrategy,
        fine: i64,
        lower_inclusive: i64,
        upper_inclusive: i64,
    ) -> Result<Vec<QueueEntry>> {
        let mut pages = self.partition_pages(ss, fine, lower_inclusive, upper_inclusive);
        let mut entries = Vec::new();
        while let Some(entry) = pages.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    fn partition_pages(
        &self,
        ss: ShardAndStrategy,
        fine: i64,
        lower_inclusive: i64,
        upper_inclusive: i64,
    ) -> PartitionPages<'_> {
        let next_column = (lower_inclusive <= upper_inclusive).then(|| inline_column_lower_bound(lower_inclusive));
        PartitionPages {
            kvs: self.kvs.as_ref(),
            table: &self.table,
            row: inline_cells_row(ss, fine),
            next_column,
            end_column: inline_column_upper_bound(upper_inclusive),
            page: Vec::new().into_iter(),
        }
    }

    /// Writes stored in the dedicated rows of `start_ts`
    pub fn read_dedicated(
        &self,
        ss: ShardAndStrategy,
        fine: i64,
        start_ts: i64,
        rows: i64,
    ) -> Result<Vec<WriteReference>> {
        let mut refs = Vec::new();
        for row_number in 0..rows {
            let row = dedicated_cells_row(ss, fine, start_ts, row_number);
            for (_, value) in
                self.kvs
                    .get_row_column_range(&self.table, &row, &ColumnRange::all(), QUEUE_READ_TIMESTAMP, None)?
            {
                refs.push(deserialize_write_reference(value.contents())?);
            }
        }
        Ok(refs)
    }

    /// Resolve the candidates of `fine` with start timestamps in
    /// `(exclusive_lower_ts, inclusive_upper_ts]` into a sweep batch
    ///
    /// Reads until `SWEEP_BATCH_SIZE` entries are held, then finishes the
    /// current start timestamp. Stops before the first start timestamp that
    /// committed after `inclusive_upper_ts` or whose outcome is unknown; such
    /// a batch is marked not fully processed and its progress never passes
    /// the last start timestamp resolved before the stop.
    pub fn get_batch_for_partition(
        &self,
        ss: ShardAndStrategy,
        fine: i64,
        exclusive_lower_ts: i64,
        inclusive_upper_ts: i64,
    ) -> Result<SweepBatch> {
        let sweep_ts = inclusive_upper_ts.saturating_add(1);
        let lower = exclusive_lower_ts
            .saturating_add(1)
            .max(min_ts_for_fine_partition(fine));
        let upper = inclusive_upper_ts.min(max_ts_for_fine_partition(fine));
        let mut pages = self.partition_pages(ss, fine, lower, upper);

        let mut groups: BTreeMap<i64, Vec<WriteReference>> = BTreeMap::new();
        let mut dedicated = Vec::new();
        let mut entries_read = 0usize;
        let mut last_taken: Option<i64> = None;
        let mut stopped_on_known_commit = false;
        let mut more_remaining = false;

        while let Some(entry) = pages.next_entry()? {
            let start_ts = entry.start_ts();
            if last_taken != Some(start_ts) {
                if entries_read >= SWEEP_BATCH_SIZE {
                    more_remaining = true;
                    break;
                }
                if self.commit_ts_cache.is_known_committed_at_or_after(start_ts, sweep_ts) {
                    entries_read += 1;
                    stopped_on_known_commit = true;
                    break;
                }
            }
            let group = groups.entry(start_ts).or_default();
            match entry {
                QueueEntry::Write { write_ref, .. } => {
                    group.push(write_ref);
                    entries_read += 1;
                }
                QueueEntry::Dedicated { rows, .. } => {
                    let refs = self.read_dedicated(ss, fine, start_ts, rows)?;
                    entries_read += refs.len();
                    group.extend(refs);
                    dedicated.push(DedicatedRows {
                        fine_partition: fine,
                        start_ts,
                    });
                }
            }
            last_taken = Some(start_ts);
        }

        let start_timestamps: BTreeSet<i64> = groups.keys().copied().collect();
        let outcomes = self.commit_ts_cache.load(&start_timestamps)?;

        let mut latest: BTreeMap<(TableRef, Cell), WriteInfo> = BTreeMap::new();
        let mut aborted = Vec::new();
        let mut last_resolved: Option<i64> = None;
        let mut hit_unsweepable = false;
        for (start_ts, refs) in groups {
            match WriteClassification::of(outcomes.get(&start_ts).copied(), sweep_ts) {
                WriteClassification::Committed => {
                    for write_ref in refs {
                        let key = (write_ref.table.clone(), write_ref.cell.clone());
                        latest.insert(key, WriteInfo { write_ref, timestamp: start_ts });
                    }
                }
                WriteClassification::Aborted => {
                    aborted.extend(refs.into_iter().map(|write_ref| WriteInfo {
                        write_ref,
                        timestamp: start_ts,
                    }));
                }
                WriteClassification::NotYetSweepable => {
                    hit_unsweepable = true;
                    break;
                }
            }
            last_resolved = Some(start_ts);
        }

        let processed_all = !hit_unsweepable && !stopped_on_known_commit;
        let last_swept_timestamp = if !processed_all || more_remaining {
            last_resolved.unwrap_or(exclusive_lower_ts)
        } else {
            max_ts_for_fine_partition(fine)
                .min(inclusive_upper_ts)
                .max(exclusive_lower_ts)
        };
        dedicated.retain(|rows: &DedicatedRows| last_resolved.map_or(false, |ts| rows.start_ts <= ts));

        debug!(
            target: "tsweep::queue",
            %ss,
            fine,
            entries_read,
            writes = latest.len(),
            aborted = aborted.len(),
            processed_all,
            last_swept_timestamp,
            "Read sweep batch"
        );

        Ok(SweepBatch {
            writes: latest.into_values().collect(),
            aborted,
            dedicated_rows: dedicated,
            last_swept_timestamp,
            entries_read,
            processed_all,
        })
    }

    // ========================================================================
    // Cleaning
    // ========================================================================

    /// Drop the dedicated rows of one fully swept start timestamp
    pub fn delete_dedicated_rows(&self, ss: ShardAndStrategy, rows: DedicatedRows) -> Result<()> {
        let range = RangeRequest::prefix(&dedicated_rows_prefix(ss, rows.fine_partition, rows.start_ts));
        self.kvs.delete_range(&self.table, &range)
    }

    /// Drop every row, inline and dedicated, of fine partitions `[from_fine, to_fine)`
    pub fn clean(&self, ss: ShardAndStrategy, from_fine: i64, to_fine: i64) -> Result<()> {
        if from_fine >= to_fine {
            return Ok(());
        }
        let range = RangeRequest::rows(partition_prefix(ss, from_fine), partition_prefix(ss, to_fine));
        self.kvs.delete_range(&self.table, &range)
    }
}

/// Inline entries of one partition row, fetched a page at a time
struct PartitionPages<'a> {
    kvs: &'a dyn KeyValueService,
    table: &'a TableRef,
    row: Vec<u8>,
    /// First column of the next page; `None` once the row is exhausted
    next_column: Option<Vec<u8>>,
    end_column: Option<Vec<u8>>,
    page: std::vec::IntoIter<QueueEntry>,
}

impl PartitionPages<'_> {
    fn next_entry(&mut self) -> Result<Option<QueueEntry>> {
        loop {
            if let Some(entry) = self.page.next() {
                return Ok(Some(entry));
            }
            let Some(start) = self.next_column.take() else {
                return Ok(None);
            };
            let columns = ColumnRange {
                start: Some(start),
                end: self.end_column.clone(),
            };
            let cells = self.kvs.get_row_column_range(
                self.table,
                &self.row,
                &columns,
                QUEUE_READ_TIMESTAMP,
                Some(INLINE_PAGE_SIZE),
            )?;
            if cells.len() == INLINE_PAGE_SIZE {
                self.next_column = cells.last().map(|(cell, _)| {
                    let mut after = cell.column().to_vec();
                    after.push(0);
                    after
                });
            }

            let mut entries = Vec::with_capacity(cells.len());
            for (cell, value) in cells {
                let (start_ts, id) = decode_inline_cells_column(cell.column())?;
                if id < 0 {
                    entries.push(QueueEntry::Dedicated { start_ts, rows: -id });
                } else {
                    entries.push(QueueEntry::Write {
                        start_ts,
                        write_ref: deserialize_write_reference(value.contents())?,
                    });
                }
            }
            self.page = entries.into_iter();
        }
    }
}
