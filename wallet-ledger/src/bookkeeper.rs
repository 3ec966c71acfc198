//! Committed balance cache
//!
//! Holds the last committed [`WalletState`] of each wallet, keyed by wallet
//! UUID. A miss falls back to the record store:
//! 1. lock the missing UUIDs (one reload per wallet at a time)
//! 2. re-check the cache, another context may have filled it meanwhile
//! 3. load committed rows with their transaction aggregates and verify
//!    checksums; rows of the calling context's open transaction never reach
//!    the shared cache
//! 4. fill the cache with set-if-absent, so a stale load never overwrites
//!    a state synced after commit
//!
//! `sync`/`multi_sync` overwrite unconditionally and are only called after
//! a physical commit.

use crate::cache::KeyedCache;
use crate::checksum::ChecksumService;
use crate::lock::LockManager;
use crate::metrics::Metrics;
use crate::store::{RecordStore, WalletKey};
use crate::types::WalletState;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const CACHE_PREFIX: &str = "ledger:bookkeeper:";

/// Lock key serializing store fallbacks of one wallet
pub fn bookkeeper_lock_key(uuid: &Uuid) -> String {
    format!("bookkeeper::{}", uuid)
}

fn cache_key(uuid: &Uuid) -> String {
    format!("{}{}", CACHE_PREFIX, uuid)
}

/// Balance cache with record-store fallback
pub struct Bookkeeper {
    cache: Arc<dyn KeyedCache<WalletState>>,
    store: Arc<dyn RecordStore>,
    locks: Arc<LockManager>,
    checksum: ChecksumService,
    ttl: Option<Duration>,
    metrics: Metrics,
}

impl std::fmt::Debug for Bookkeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bookkeeper")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Bookkeeper {
    /// Create a bookkeeper
    pub fn new(
        cache: Arc<dyn KeyedCache<WalletState>>,
        store: Arc<dyn RecordStore>,
        locks: Arc<LockManager>,
        checksum: ChecksumService,
        ttl: Option<Duration>,
        metrics: Metrics,
    ) -> Self {
        Self {
            cache,
            store,
            locks,
            checksum,
            ttl,
            metrics,
        }
    }

    /// Committed state of one wallet
    pub fn get(&self, uuid: &Uuid) -> Result<WalletState> {
        self.multi_get(std::slice::from_ref(uuid))?
            .remove(uuid)
            .ok_or_else(|| Error::RecordNotFound(format!("wallet {}", uuid)))
    }

    /// Committed states of many wallets
    pub fn multi_get(&self, uuids: &[Uuid]) -> Result<HashMap<Uuid, WalletState>> {
        let keys: Vec<String> = uuids.iter().map(cache_key).collect();

        let missing = match self.cache.multi_get(&keys) {
            Ok(found) => {
                self.metrics.record_cache_hits(keys.len() as u64);
                return Ok(by_uuid(uuids, found));
            }
            Err(missing) => missing,
        };

        let absent: Vec<Uuid> = uuids
            .iter()
            .filter(|uuid| missing.keys.contains(&cache_key(uuid)))
            .copied()
            .collect();
        self.metrics
            .record_cache_hits(keys.len().saturating_sub(missing.keys.len()) as u64);
        self.metrics.record_cache_misses(absent.len() as u64);

        let mut states = self.load(&absent)?;
        for (uuid, key) in uuids.iter().zip(&keys) {
            if states.contains_key(uuid) {
                continue;
            }
            let state = self
                .cache
                .get(key)
                .ok_or_else(|| Error::RecordNotFound(format!("wallet {}", uuid)))?;
            states.insert(*uuid, state);
        }
        Ok(states)
    }

    /// Overwrite one committed state
    pub fn sync(&self, uuid: &Uuid, state: WalletState) {
        self.cache.set(&cache_key(uuid), state, self.ttl);
    }

    /// Overwrite many committed states
    pub fn multi_sync(&self, states: HashMap<Uuid, WalletState>) {
        if states.is_empty() {
            return;
        }
        let values = states
            .into_iter()
            .map(|(uuid, state)| (cache_key(&uuid), state))
            .collect();
        self.cache.multi_set(values, self.ttl);
    }

    /// Drop one cached state
    pub fn forget(&self, uuid: &Uuid) {
        self.cache.delete(&cache_key(uuid));
    }

    fn load(&self, uuids: &[Uuid]) -> Result<HashMap<Uuid, WalletState>> {
        let lock_keys: Vec<String> = uuids.iter().map(bookkeeper_lock_key).collect();

        self.locks.blocks(&lock_keys, || {
            let mut states = HashMap::with_capacity(uuids.len());
            let mut pending = Vec::new();

            for uuid in uuids {
                match self.cache.get(&cache_key(uuid)) {
                    Some(state) => {
                        states.insert(*uuid, state);
                    }
                    None => pending.push(WalletKey::Uuid(*uuid)),
                }
            }

            if pending.is_empty() {
                return Ok(states);
            }

            for row in self.store.multi_get_committed_wallets(&pending)? {
                self.checksum.verify_wallet(
                    &row.wallet,
                    row.transaction_count,
                    &row.transaction_sum,
                )?;

                let uuid = row.wallet.uuid;
                let key = cache_key(&uuid);
                let loaded = WalletState {
                    balance: row.wallet.balance,
                    frozen_amount: row.wallet.frozen_amount,
                    transaction_count: row.transaction_count,
                };

                let state = if self.cache.add(&key, loaded.clone(), self.ttl) {
                    loaded
                } else {
                    // a commit synced a newer state while we were loading
                    self.cache.get(&key).unwrap_or(loaded)
                };
                tracing::debug!(wallet = %uuid, "Balance loaded from record store");
                states.insert(uuid, state);
            }

            // wallets created by the calling context's open transaction are
            // not committed yet; serve them from its journal, never cache them
            let uncommitted: Vec<WalletKey> = uuids
                .iter()
                .filter(|uuid| !states.contains_key(uuid))
                .map(|uuid| WalletKey::Uuid(*uuid))
                .collect();
            if !uncommitted.is_empty() {
                for row in self.store.multi_get_wallets(&uncommitted)? {
                    self.checksum.verify_wallet(
                        &row.wallet,
                        row.transaction_count,
                        &row.transaction_sum,
                    )?;
                    tracing::debug!(wallet = %row.wallet.uuid, "Balance loaded from open transaction");
                    states.insert(
                        row.wallet.uuid,
                        WalletState {
                            balance: row.wallet.balance,
                            frozen_amount: row.wallet.frozen_amount,
                            transaction_count: row.transaction_count,
                        },
                    );
                }
            }

            for uuid in uuids {
                if !states.contains_key(uuid) {
                    return Err(Error::RecordNotFound(format!("wallet {}", uuid)));
                }
            }

            Ok(states)
        })
    }
}

fn by_uuid(uuids: &[Uuid], mut found: HashMap<String, WalletState>) -> HashMap<Uuid, WalletState> {
    uuids
        .iter()
        .filter_map(|uuid| found.remove(&cache_key(uuid)).map(|state| (*uuid, state)))
        .collect()
}
