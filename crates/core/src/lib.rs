//! Core types and traits for targeted sweep
//!
//! This crate defines the foundational types used throughout the system:
//! - TableRef, Cell, Value: addresses and versions in the key-value store
//! - WriteInfo, ShardAndStrategy, SweepStrategy: sweep queue entries and partitions
//! - CommitStatus, WriteClassification: commit-visibility resolution
//! - LockRequest, LockToken: shard leasing
//! - Error: error taxonomy
//! - Traits: collaborator interfaces (KeyValueService, TransactionService,
//!   TimestampsSupplier, TimelockService, TargetedSweepFollower)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod lock_types;
pub mod sweep_types;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use lock_types::{LockDescriptor, LockRequest, LockToken};
pub use sweep_types::{
    CommitStatus, ShardAndStrategy, SweepStrategy, WriteClassification, WriteInfo, WriteReference,
};
pub use traits::{
    KeyValueService, NoOpFollower, TargetedSweepFollower, TimelockService, TimestampsSupplier,
    TransactionService,
};
pub use types::{
    next_lexicographic, Cell, CheckAndSetRequest, ColumnRange, RangeRequest, TableMetadata,
    TableRef, TableSweepStrategy, Value, SENTINEL_TIMESTAMP,
};
