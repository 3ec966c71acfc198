//! Atomic blocks over wallet sets
//!
//! [`AtomicCoordinator::blocks`] locks the wallets the calling context does
//! not hold yet, seeds the pending ledger with their committed state and
//! runs the closure inside the host transaction.
//!
//! - Outside a transaction a new one is opened around the closure; the
//!   locks are released and the fork snapshots of the wallets this call
//!   locked are dropped when the call returns.
//! - Inside a transaction the locks are deferred to its end, so no other
//!   context can interleave before commit. The forks stay until the
//!   transaction ends and the regulator is purged, so later reads never
//!   fall back to the record store mid-transaction.

use crate::database::Database;
use crate::lock::{wallet_lock_key, LockManager};
use crate::regulator::Regulators;
use crate::types::Wallet;
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Runs closures under wallet locks inside the host transaction
pub struct AtomicCoordinator {
    db: Arc<Database>,
    locks: Arc<LockManager>,
    regulators: Arc<Regulators>,
}

impl std::fmt::Debug for AtomicCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicCoordinator").finish_non_exhaustive()
    }
}

impl AtomicCoordinator {
    /// Create a coordinator
    pub fn new(db: Arc<Database>, locks: Arc<LockManager>, regulators: Arc<Regulators>) -> Self {
        Self {
            db,
            locks,
            regulators,
        }
    }

    /// Run `f` with `wallet` locked
    pub fn block<R>(&self, wallet: &Wallet, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.blocks(std::slice::from_ref(wallet), f)
    }

    /// Run `f` with every wallet locked
    pub fn blocks<R>(&self, wallets: &[Wallet], f: impl FnOnce() -> Result<R>) -> Result<R> {
        let mut seen = HashSet::new();
        let fresh: Vec<Wallet> = wallets
            .iter()
            .filter(|wallet| seen.insert(wallet.uuid))
            .filter(|wallet| !self.locks.is_blocked(&wallet_lock_key(&wallet.uuid)))
            .cloned()
            .collect();

        if fresh.is_empty() {
            return f();
        }

        let keys: Vec<String> = fresh.iter().map(|w| wallet_lock_key(&w.uuid)).collect();
        let guard = self.locks.acquire_many(&keys)?;

        if self.db.in_transaction() {
            guard.defer();
            self.regulators.current().seed(&fresh)?;
            return f();
        }

        let _forks = ForkGuard {
            regulators: &self.regulators,
            uuids: fresh.iter().map(|w| w.uuid).collect(),
        };
        self.db.transaction(|| {
            self.regulators.current().seed(&fresh)?;
            f()
        })
    }
}

/// Drops the fork snapshots of one `blocks` call on every exit path
struct ForkGuard<'a> {
    regulators: &'a Regulators,
    uuids: Vec<Uuid>,
}

impl Drop for ForkGuard<'_> {
    fn drop(&mut self) {
        if let Some(regulator) = self.regulators.existing() {
            regulator.drop_forks(&self.uuids);
        }
    }
}
