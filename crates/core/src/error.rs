//! Error types for the targeted sweep engine
//!
//! One error enum is shared by every crate in the workspace. We use
//! `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! The hard stop taken when a sweep reaches a write committed after the sweep
//! timestamp is not an error: it is reported as data on the sweep batch.

use crate::types::TableRef;
use thiserror::Error;

/// Result type alias for sweep operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the targeted sweep engine
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted before the component finished initializing.
    ///
    /// Always recoverable by retrying once initialization completes.
    #[error("{component} is not initialized yet")]
    NotInitialized {
        /// Human readable component name, e.g. "Targeted Sweeper"
        component: &'static str,
    },

    /// A collaborator is in a state that makes the operation impossible
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Configuration that would corrupt or truncate data (fatal)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Key-value store, lock service or transaction table failure (transient)
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Conditional write lost against a concurrent writer
    #[error("Check and set failed on table {table}")]
    CheckAndSetFailed {
        /// Table the conditional write targeted
        table: TableRef,
        /// Value found in place of the expected one
        current: Option<Vec<u8>>,
    },

    /// `put_unless_exists` found an existing value
    #[error("Key already exists in table {table}")]
    KeyAlreadyExists {
        /// Table the write targeted
        table: TableRef,
    },

    /// Serialization/deserialization of persisted queue entries
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether a retry on the next scheduling tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NotInitialized { .. }
                | Error::UpstreamUnavailable(_)
                | Error::CheckAndSetFailed { .. }
        )
    }
}
