//! Storage layer for the targeted sweep engine
//!
//! This crate provides the key-value stores the sweep engine runs against:
//! - InMemoryKeyValueService: DashMap of tables, each an ordered map of version chains
//! - VersionChain: every version of one cell keyed by timestamp
//! - testing::RecordingKeyValueService: spying wrapper with failure injection
//!
//! # Concurrency
//!
//! - Tables are sharded through a DashMap keyed by table name
//! - FxHasher for cheap table lookups
//! - One RwLock per table; a single call holds it once

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod in_memory;
pub mod testing;

pub use in_memory::{InMemoryKeyValueService, VersionChain};
pub use testing::{KvsCall, RecordingKeyValueService};
