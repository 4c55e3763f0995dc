//! Shard leases
//!
//! A background worker sweeps a (shard, strategy) pair only while it holds
//! the lease on the pair's lock descriptor. Leases are an optimization
//! against duplicate work: two workers sweeping the same pair stay correct.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tsweep_core::{LockDescriptor, LockRequest, LockToken, Result, ShardAndStrategy, TimelockService};

/// Lease on one (shard, strategy) pair, released on drop
pub struct TargetedSweeperLock {
    ss: ShardAndStrategy,
    timelock: Arc<dyn TimelockService>,
    token: Option<LockToken>,
}

impl TargetedSweeperLock {
    /// Try to take the lease for `ss`, waiting at most `acquire_timeout`
    ///
    /// Returns `Ok(None)` when another holder keeps the lease.
    pub fn try_acquire(
        ss: ShardAndStrategy,
        timelock: Arc<dyn TimelockService>,
        acquire_timeout: Duration,
    ) -> Result<Option<Self>> {
        let request = LockRequest::single(LockDescriptor::new(ss.to_text()), acquire_timeout);
        let token = timelock.lock(&request)?;
        Ok(token.map(|token| {
            debug!(target: "tsweep::lock", %ss, %token, "Acquired shard lease");
            Self {
                ss,
                timelock,
                token: Some(token),
            }
        }))
    }

    /// Pair this lease covers
    pub fn shard_and_strategy(&self) -> ShardAndStrategy {
        self.ss
    }

    /// Extend the lease; `false` means it was lost (expired or taken over)
    pub fn refresh(&self) -> Result<bool> {
        let Some(token) = self.token else {
            return Ok(false);
        };
        let refreshed = self.timelock.refresh_lock_leases(&HashSet::from([token]))?;
        Ok(refreshed.contains(&token))
    }

    /// Release the lease now
    ///
    /// Failures are logged and swallowed; the lock service's lease expiry
    /// frees the descriptor eventually.
    pub fn unlock(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match self.timelock.unlock(&HashSet::from([token])) {
            Ok(released) if released.contains(&token) => {
                debug!(target: "tsweep::lock", ss = %self.ss, %token, "Released shard lease");
            }
            Ok(_) => {
                debug!(target: "tsweep::lock", ss = %self.ss, %token, "Shard lease had already expired");
            }
            Err(e) => {
                warn!(target: "tsweep::lock", ss = %self.ss, %token, error = %e, "Failed to release shard lease");
            }
        }
    }
}

impl Drop for TargetedSweeperLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl std::fmt::Debug for TargetedSweeperLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetedSweeperLock")
            .field("ss", &self.ss)
            .field("token", &self.token)
            .finish()
    }
}
