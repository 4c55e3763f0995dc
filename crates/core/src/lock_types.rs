//! Lock service request and token types

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use uuid::Uuid;

/// A named lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockDescriptor(String);

impl LockDescriptor {
    /// Descriptor for a string lock id
    pub fn new(lock_id: impl Into<String>) -> Self {
        Self(lock_id.into())
    }

    /// The lock id
    pub fn lock_id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request for a set of exclusive locks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// All locks to take atomically
    pub descriptors: BTreeSet<LockDescriptor>,
    /// How long the lock service may wait for the locks to free up
    pub acquire_timeout: Duration,
}

impl LockRequest {
    /// Request a single lock
    pub fn single(descriptor: LockDescriptor, acquire_timeout: Duration) -> Self {
        let mut descriptors = BTreeSet::new();
        descriptors.insert(descriptor);
        Self {
            descriptors,
            acquire_timeout,
        }
    }
}

/// Proof of a held lease, used to refresh and release it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Token with a fresh random id
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Token wrapping an existing id
    pub fn of(id: Uuid) -> Self {
        Self(id)
    }

    /// Request id of this token
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
