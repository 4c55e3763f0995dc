//! Testing utilities for code that drives a `KeyValueService`
//!
//! - **RecordingKeyValueService**: wraps the in-memory store, records every
//!   mutating call and can be switched into a failing mode
//!
//! # Example
//!
//! ```ignore
//! use tsweep_storage::testing::RecordingKeyValueService;
//!
//! let kvs = RecordingKeyValueService::new();
//! sweeper.sweep_next_batch(ShardAndStrategy::conservative(0))?;
//! assert_eq!(kvs.delete_all_timestamps_calls(&table).len(), 1);
//! ```

mod recording;

pub use recording::{KvsCall, RecordingKeyValueService};
