//! Coordination services for the targeted sweep engine
//!
//! This crate implements the in-memory collaborators the sweeper resolves
//! commits, timestamps and leases against:
//! - InMemoryTransactionService: start timestamp -> commit outcome
//! - TimestampAllocator / ManualTimestampsSupplier: fresh timestamps and sweep boundaries
//! - InMemoryTimelockService: exclusive leases that expire unless refreshed

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock_service;
pub mod timestamps;
pub mod transaction;

pub use lock_service::InMemoryTimelockService;
pub use timestamps::{ManualTimestampsSupplier, TimestampAllocator};
pub use transaction::InMemoryTransactionService;
