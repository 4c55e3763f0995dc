//! tsweep - Targeted sweep for a multi-version, timestamp-ordered key-value store
//!
//! Every committed write is recorded in a persistent sweep queue stored in the
//! same key-value store. Sweepers walk the queue in timestamp order, one shard
//! and strategy at a time, and delete the history each write made obsolete.
//!
//! # Quick Start
//!
//! ```ignore
//! use tsweep::{ShardAndStrategy, SweepResources, TargetedSweepConfig, TargetedSweeper};
//!
//! let sweeper = TargetedSweeper::create_uninitialized(TargetedSweepConfig::default())?;
//! sweeper.initialize(SweepResources::new(kvs, transactions, timestamps, timelock))?;
//!
//! // After each commit
//! sweeper.enqueue(&writes)?;
//!
//! // Background workers sweep on their own; sweeping can also be driven directly
//! sweeper.sweep_next_batch(ShardAndStrategy::conservative(0))?;
//! ```
//!
//! # Architecture
//!
//! - `tsweep_core`: addresses, write records, collaborator traits and errors
//! - `tsweep_storage`: in-memory key-value store and a recording wrapper
//! - `tsweep_concurrency`: in-memory transactions, timestamps and leases
//! - `tsweep_queue`: the persistent sweep queue and batch application
//! - `tsweep_engine`: the sweeper lifecycle, background workers and config

pub use tsweep_core::*;
pub use tsweep_engine::*;
pub use tsweep_queue::{SweepOutcome, SweepQueue, StrategyMetrics, TargetedSweepMetrics};

pub use tsweep_concurrency as concurrency;
pub use tsweep_queue as queue;
pub use tsweep_storage as storage;
