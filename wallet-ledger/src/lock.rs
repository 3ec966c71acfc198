//! Named locks with TTL and reentrancy
//!
//! # Protocol
//!
//! - keys are acquired in sorted, de-duplicated order (no circular wait)
//! - keys the calling context already holds are neither re-acquired nor
//!   released early
//! - acquisition retries with jittered exponential backoff until the
//!   configured timeout, then fails with `TransactionFailed`
//! - the TTL bounds how long a crashed holder keeps a key
//!
//! Releasing is tied to [`LockSet`]'s drop, so every exit path (errors and
//! panics included) gives the keys back. A set can instead be deferred to
//! the end of the host transaction with [`LockSet::defer`].

use crate::cache::KeyedCache;
use crate::context::ContextId;
use crate::metrics::Metrics;
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Lock key serializing mutations of one wallet
pub fn wallet_lock_key(uuid: &Uuid) -> String {
    format!("wallet_lock::{}", uuid)
}

/// Storage for lock leases
///
/// Implementations must make `try_acquire` atomic. Re-acquiring a key the
/// same owner already holds succeeds and refreshes the lease.
pub trait LockBackend: Send + Sync {
    /// Take `key` for `owner` unless someone else holds a live lease
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Give `key` back if `owner` holds it
    fn release(&self, key: &str, owner: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// In-process lock table
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    leases: DashMap<String, Lease>,
}

impl MemoryLockBackend {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockBackend for MemoryLockBackend {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let lease = Lease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.owner == owner || current.expires_at <= now {
                    entry.insert(lease);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(lease);
                Ok(true)
            }
        }
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.leases.remove_if(key, |_, lease| lease.owner == owner);
        Ok(())
    }
}

/// Locks stored in a shared [`KeyedCache`] through set-if-absent
///
/// Release is check-then-delete; a lease that expired and was taken over
/// between the two steps can be dropped early.
pub struct CacheLockBackend {
    cache: Arc<dyn KeyedCache<String>>,
}

impl std::fmt::Debug for CacheLockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLockBackend").finish_non_exhaustive()
    }
}

impl CacheLockBackend {
    /// Create over a shared cache
    pub fn new(cache: Arc<dyn KeyedCache<String>>) -> Self {
        Self { cache }
    }
}

impl LockBackend for CacheLockBackend {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        if self.cache.add(key, owner.to_string(), Some(ttl)) {
            return Ok(true);
        }
        if self.cache.get(key).as_deref() == Some(owner) {
            self.cache.set(key, owner.to_string(), Some(ttl));
            return Ok(true);
        }
        Ok(false)
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        if self.cache.get(key).as_deref() == Some(owner) {
            self.cache.delete(key);
        }
        Ok(())
    }
}

/// Lock manager
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    held: DashMap<ContextId, HashSet<String>>,
    deferred: DashMap<ContextId, Vec<String>>,
    ttl: Duration,
    timeout: Duration,
    metrics: Metrics,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .field("contexts", &self.held.len())
            .finish()
    }
}

impl LockManager {
    /// Create a manager over `backend`
    pub fn new(
        backend: Arc<dyn LockBackend>,
        ttl: Duration,
        timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            backend,
            held: DashMap::new(),
            deferred: DashMap::new(),
            ttl,
            timeout,
            metrics,
        }
    }

    /// Whether the calling context holds `key`
    pub fn is_blocked(&self, key: &str) -> bool {
        self.held
            .get(&ContextId::current())
            .map_or(false, |keys| keys.contains(key))
    }

    /// Run `f` holding `key`
    pub fn block<R>(&self, key: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.blocks(&[key.to_string()], f)
    }

    /// Run `f` holding every key; released on every exit
    pub fn blocks<R>(&self, keys: &[String], f: impl FnOnce() -> Result<R>) -> Result<R> {
        let _guard = self.acquire_many(keys)?;
        f()
    }

    /// Acquire the keys the calling context does not hold yet
    ///
    /// The returned set owns exactly the newly acquired keys.
    pub fn acquire_many(&self, keys: &[String]) -> Result<LockSet<'_>> {
        let mut wanted: Vec<String> = keys
            .iter()
            .filter(|key| !self.is_blocked(key))
            .cloned()
            .collect();
        wanted.sort();
        wanted.dedup();

        let context = ContextId::current();
        let owner = context.to_string();
        let mut set = LockSet {
            manager: self,
            keys: Vec::with_capacity(wanted.len()),
            deferred: false,
        };

        for key in wanted {
            // partial acquisitions are released by the set's drop
            self.acquire(&key, &owner)?;
            self.held.entry(context).or_default().insert(key.clone());
            set.keys.push(key);
        }

        Ok(set)
    }

    /// Release keys the calling context holds; others are ignored
    pub fn releases(&self, keys: &[String]) -> Result<()> {
        let context = ContextId::current();
        let owner = context.to_string();
        let mut result = Ok(());

        for key in keys {
            let owned = self
                .held
                .get_mut(&context)
                .map_or(false, |mut held| held.remove(key));
            if !owned {
                continue;
            }
            if let Err(err) = self.backend.release(key, &owner) {
                tracing::warn!(key = %key, error = %err, "Failed to release lock");
                result = Err(err);
            } else {
                tracing::debug!(key = %key, "Lock released");
            }
        }

        self.held.remove_if(&context, |_, held| held.is_empty());
        if let Some(mut deferred) = self.deferred.get_mut(&context) {
            deferred.retain(|key| !keys.contains(key));
        }
        self.deferred.remove_if(&context, |_, deferred| deferred.is_empty());

        result
    }

    /// Release every key deferred to the end of the host transaction
    pub fn release_deferred(&self) -> Result<()> {
        match self.deferred.remove(&ContextId::current()) {
            Some((_, keys)) => self.releases(&keys),
            None => Ok(()),
        }
    }

    fn acquire(&self, key: &str, owner: &str) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.backend.try_acquire(key, owner, self.ttl)? {
                self.metrics
                    .record_lock_wait(started.elapsed().as_secs_f64());
                tracing::debug!(key = %key, "Lock acquired");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                self.metrics.record_lock_timeout();
                tracing::warn!(key = %key, timeout = ?self.timeout, "Lock wait timeout");
                return Err(Error::TransactionFailed(format!(
                    "lock wait timeout for {}",
                    key
                )));
            }

            let ceiling = backoff.as_micros() as u64;
            let jitter = Duration::from_micros(rand::thread_rng().gen_range(0..=ceiling));
            std::thread::sleep((backoff + jitter).min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// Keys acquired by one [`LockManager::acquire_many`] call
#[must_use = "dropping the set releases its keys"]
pub struct LockSet<'a> {
    manager: &'a LockManager,
    keys: Vec<String>,
    deferred: bool,
}

impl std::fmt::Debug for LockSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSet")
            .field("keys", &self.keys)
            .field("deferred", &self.deferred)
            .finish()
    }
}

impl LockSet<'_> {
    /// Newly acquired keys
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Keep the keys until [`LockManager::release_deferred`]
    pub fn defer(mut self) {
        if !self.keys.is_empty() {
            self.manager
                .deferred
                .entry(ContextId::current())
                .or_default()
                .extend(self.keys.iter().cloned());
        }
        self.deferred = true;
    }
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        if self.deferred || self.keys.is_empty() {
            return;
        }
        // errors already logged by `releases`
        let _ = self.manager.releases(&self.keys);
    }
}
