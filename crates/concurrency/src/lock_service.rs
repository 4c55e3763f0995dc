//! In-memory lease-based lock service
//!
//! A granted lock is a lease: it expires `lease_duration` after it was granted
//! or last refreshed, after which another caller may take the same
//! descriptors. Expiry is evaluated lazily against `current_time_millis`,
//! which can be moved forward with [`InMemoryTimelockService::advance_time`].
//!
//! # Blocking
//!
//! `lock` waits up to the request's acquire timeout for a holder to unlock.
//! A waiter is woken by every unlock and re-checks all of its descriptors.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

use tsweep_core::{Error, LockDescriptor, LockRequest, LockToken, Result, TimelockService};

/// Default lease length
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Lease {
    descriptors: BTreeSet<LockDescriptor>,
    expires_at_millis: i64,
}

#[derive(Debug, Default)]
struct LockTable {
    holders: HashMap<LockDescriptor, LockToken>,
    leases: HashMap<LockToken, Lease>,
}

impl LockTable {
    fn expire(&mut self, now_millis: i64) {
        let expired: Vec<LockToken> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at_millis <= now_millis)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            self.release(&token);
        }
    }

    fn release(&mut self, token: &LockToken) -> bool {
        match self.leases.remove(token) {
            Some(lease) => {
                for descriptor in &lease.descriptors {
                    self.holders.remove(descriptor);
                }
                true
            }
            None => false,
        }
    }

    fn all_free(&self, descriptors: &BTreeSet<LockDescriptor>) -> bool {
        descriptors.iter().all(|d| !self.holders.contains_key(d))
    }
}

/// Lock service keeping leases in process memory
pub struct InMemoryTimelockService {
    table: Mutex<LockTable>,
    released: Condvar,
    lease_duration: Duration,
    clock_offset_millis: AtomicI64,
    unavailable: AtomicBool,
    lock_calls: AtomicU64,
    unlock_calls: AtomicU64,
}

impl InMemoryTimelockService {
    /// Lock service with the default lease length
    pub fn new() -> Self {
        Self::with_lease_duration(DEFAULT_LEASE_DURATION)
    }

    /// Lock service whose leases last `lease_duration`
    pub fn with_lease_duration(lease_duration: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            lease_duration,
            clock_offset_millis: AtomicI64::new(0),
            unavailable: AtomicBool::new(false),
            lock_calls: AtomicU64::new(0),
            unlock_calls: AtomicU64::new(0),
        }
    }

    /// Move this service's clock forward
    pub fn advance_time(&self, by: Duration) {
        self.clock_offset_millis
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// While set, every call fails with `UpstreamUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Descriptors currently held by an unexpired lease
    pub fn held_descriptors(&self) -> BTreeSet<LockDescriptor> {
        let now = self.now_millis();
        let mut table = self.table.lock();
        table.expire(now);
        table.holders.keys().cloned().collect()
    }

    /// Number of `lock` calls made
    pub fn lock_calls(&self) -> u64 {
        self.lock_calls.load(Ordering::Relaxed)
    }

    /// Number of `unlock` calls made
    pub fn unlock_calls(&self) -> u64 {
        self.unlock_calls.load(Ordering::Relaxed)
    }

    fn now_millis(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        wall + self.clock_offset_millis.load(Ordering::SeqCst)
    }

    fn lease_millis(&self) -> i64 {
        self.lease_duration.as_millis() as i64
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::UpstreamUnavailable("lock service unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryTimelockService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelockService for InMemoryTimelockService {
    fn current_time_millis(&self) -> Result<i64> {
        self.check_available()?;
        Ok(self.now_millis())
    }

    fn lock(&self, request: &LockRequest) -> Result<Option<LockToken>> {
        self.check_available()?;
        self.lock_calls.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + request.acquire_timeout;
        let mut table = self.table.lock();
        loop {
            let now = self.now_millis();
            table.expire(now);
            if table.all_free(&request.descriptors) {
                let token = LockToken::random();
                for descriptor in &request.descriptors {
                    table.holders.insert(descriptor.clone(), token);
                }
                table.leases.insert(
                    token,
                    Lease {
                        descriptors: request.descriptors.clone(),
                        expires_at_millis: now + self.lease_millis(),
                    },
                );
                debug!(target: "tsweep::lock", %token, locks = request.descriptors.len(), "Granted lease");
                return Ok(Some(token));
            }
            if self.released.wait_until(&mut table, deadline).timed_out() {
                let now = self.now_millis();
                table.expire(now);
                if !table.all_free(&request.descriptors) {
                    return Ok(None);
                }
            }
        }
    }

    fn unlock(&self, tokens: &HashSet<LockToken>) -> Result<HashSet<LockToken>> {
        self.check_available()?;
        self.unlock_calls.fetch_add(1, Ordering::Relaxed);

        let now = self.now_millis();
        let mut table = self.table.lock();
        table.expire(now);
        let released: HashSet<LockToken> = tokens
            .iter()
            .filter(|token| table.release(token))
            .copied()
            .collect();
        drop(table);
        if !released.is_empty() {
            self.released.notify_all();
        }
        Ok(released)
    }

    fn refresh_lock_leases(&self, tokens: &HashSet<LockToken>) -> Result<HashSet<LockToken>> {
        self.check_available()?;

        let now = self.now_millis();
        let expires_at_millis = now + self.lease_millis();
        let mut table = self.table.lock();
        table.expire(now);
        let mut refreshed = HashSet::with_capacity(tokens.len());
        for token in tokens {
            if let Some(lease) = table.leases.get_mut(token) {
                lease.expires_at_millis = expires_at_millis;
                refreshed.insert(*token);
            }
        }
        Ok(refreshed)
    }
}
