//! Targeted sweep engine
//!
//! This crate runs the sweep queue:
//! - TargetedSweeper: lifecycle, enqueue and on-demand sweeping
//! - Background workers with per-shard leases
//! - Retrying initialization callbacks
//! - Configuration (targeted-sweep.toml)
//!
//! The engine is the only component that knows about:
//! - Which sweep timestamp each strategy is swept up to
//! - Shard leasing across workers and processes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod callback;
pub mod config;
pub mod lock;
pub mod sweeper;

pub use background::{BackgroundSweeper, ShardSweeper};
pub use callback::{CallChain, Callback, RetryingCallback};
pub use config::{TargetedSweepConfig, CONFIG_FILE_NAME};
pub use lock::TargetedSweeperLock;
pub use sweeper::{EnabledSupplier, ShardsSupplier, SweepResources, TargetedSweeper};
