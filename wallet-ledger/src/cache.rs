//! Keyed cache with TTL
//!
//! The bookkeeper stores committed wallet states here, every pending ledger
//! owns a private instance for its deltas, and the `cache` lock driver keeps
//! lock leases in one. Hosts can substitute any [`KeyedCache`] (a shared
//! out-of-process cache, for example).
//!
//! Expiry is lazy: stale entries are dropped when they are touched.

use crate::Error;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;

/// Keys missing from a batch read
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("Missing cache keys: {}", keys.join(", "))]
pub struct MissingKeys {
    /// Exactly the absent subset of the requested keys, in request order
    pub keys: Vec<String>,
}

impl From<MissingKeys> for Error {
    fn from(err: MissingKeys) -> Self {
        Error::RecordNotFound(err.to_string())
    }
}

/// Key/value store with per-entry TTL
pub trait KeyedCache<V>: Send + Sync
where
    V: Clone + Send + Sync,
{
    /// Read one value
    fn get(&self, key: &str) -> Option<V>;

    /// Write one value unconditionally
    fn set(&self, key: &str, value: V, ttl: Option<Duration>);

    /// Write only if the key is absent; returns whether the write happened
    fn add(&self, key: &str, value: V, ttl: Option<Duration>) -> bool;

    /// Remove one key; returns whether it was present
    fn delete(&self, key: &str) -> bool;

    /// Read all keys, or report the absent subset
    fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, V>, MissingKeys>;

    /// Write many values unconditionally
    fn multi_set(&self, values: HashMap<String, V>, ttl: Option<Duration>);

    /// Remove everything
    fn flush(&self);
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn new(value: V, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory [`KeyedCache`]
#[derive(Debug)]
pub struct MemoryCache<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    default_ttl: Option<Duration>,
}

impl<V> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<V> MemoryCache<V> {
    /// Create a cache; `default_ttl` applies when a write passes `None`
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Number of entries, expired ones included until touched
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.or(self.default_ttl)
    }
}

impl<V> KeyedCache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // expired: evict unless someone refreshed it meanwhile
        let mut entries = self.entries.write();
        if entries.get(key).map_or(false, |entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        None
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let entry = Entry::new(value, self.ttl(ttl));
        self.entries.write().insert(key.to_string(), entry);
    }

    fn add(&self, key: &str, value: V, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        if entries.get(key).map_or(false, |entry| entry.is_live(now)) {
            return false;
        }
        entries.insert(key.to_string(), Entry::new(value, self.ttl(ttl)));
        true
    }

    fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .write()
            .remove(key)
            .map_or(false, |entry| entry.is_live(now))
    }

    fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, V>, MissingKeys> {
        let now = Instant::now();
        let entries = self.entries.read();
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();

        for key in keys {
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => {
                    found.insert(key.clone(), entry.value.clone());
                }
                _ => {
                    if !missing.contains(key) {
                        missing.push(key.clone());
                    }
                }
            }
        }

        if missing.is_empty() {
            Ok(found)
        } else {
            Err(MissingKeys { keys: missing })
        }
    }

    fn multi_set(&self, values: HashMap<String, V>, ttl: Option<Duration>) {
        let ttl = self.ttl(ttl);
        let mut entries = self.entries.write();
        for (key, value) in values {
            entries.insert(key, Entry::new(value, ttl));
        }
    }

    fn flush(&self) {
        self.entries.write().clear();
    }
}
