//! Timestamp sources
//!
//! `TimestampAllocator` hands out strictly increasing timestamps for test
//! transactions. `ManualTimestampsSupplier` exposes the immutable and
//! unreadable boundaries the sweeper may not cross; tests and embedders move
//! them explicitly.

use std::sync::atomic::{AtomicI64, Ordering};

use tsweep_core::{Result, TimestampsSupplier};

/// Monotonic timestamp allocator
///
/// Each call to [`TimestampAllocator::fresh_timestamp`] returns a value greater
/// than every value returned before it.
#[derive(Debug)]
pub struct TimestampAllocator {
    last: AtomicI64,
}

impl TimestampAllocator {
    /// Allocator whose first fresh timestamp is `initial + 1`
    pub fn new(initial: i64) -> Self {
        Self {
            last: AtomicI64::new(initial),
        }
    }

    /// Allocate the next timestamp
    pub fn fresh_timestamp(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Allocate `count` consecutive timestamps, returning the first
    pub fn fresh_timestamps(&self, count: i64) -> i64 {
        self.last.fetch_add(count.max(1), Ordering::SeqCst) + 1
    }

    /// Last timestamp handed out
    pub fn current(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for TimestampAllocator {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Sweep boundaries set by hand
///
/// Boundaries may move backwards; the sweeper tolerates regressions.
#[derive(Debug)]
pub struct ManualTimestampsSupplier {
    immutable: AtomicI64,
    unreadable: AtomicI64,
}

impl ManualTimestampsSupplier {
    /// Supplier with explicit boundaries
    pub fn new(immutable: i64, unreadable: i64) -> Self {
        Self {
            immutable: AtomicI64::new(immutable),
            unreadable: AtomicI64::new(unreadable),
        }
    }

    /// Move the immutable timestamp
    pub fn set_immutable(&self, timestamp: i64) {
        self.immutable.store(timestamp, Ordering::SeqCst);
    }

    /// Move the unreadable timestamp
    pub fn set_unreadable(&self, timestamp: i64) {
        self.unreadable.store(timestamp, Ordering::SeqCst);
    }

    /// Move both boundaries to the same timestamp
    pub fn set_both(&self, timestamp: i64) {
        self.set_immutable(timestamp);
        self.set_unreadable(timestamp);
    }
}

impl Default for ManualTimestampsSupplier {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl TimestampsSupplier for ManualTimestampsSupplier {
    fn immutable_timestamp(&self) -> Result<i64> {
        Ok(self.immutable.load(Ordering::SeqCst))
    }

    fn unreadable_timestamp(&self) -> Result<i64> {
        Ok(self.unreadable.load(Ordering::SeqCst))
    }
}
