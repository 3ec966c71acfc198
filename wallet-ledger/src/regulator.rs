//! Pending ledger
//!
//! One [`Regulator`] per execution context accumulates the balance, frozen
//! and count deltas of the running host transaction in a private cache.
//! Effective values are committed state (fork snapshot, else bookkeeper)
//! plus delta. Other contexts never see the deltas.
//!
//! # Lifecycle
//!
//! - `seed` forks the committed state of newly locked wallets
//! - `increase`/`decrease`/`freeze`/`un_freeze` register the wallet and
//!   adjust its delta
//! - `committing` (pre-commit) writes all changed wallets in one batch,
//!   re-reads them and verifies their checksums
//! - `committed` (post-commit) syncs the bookkeeper, emits `BalanceUpdated`
//!   and flushes the event sink
//! - `purge` drops everything and releases the registered wallets' locks
//!
//! [`Regulators`] owns the per-context instances and drives the lifecycle
//! as a [`TransactionListener`].

use crate::bookkeeper::Bookkeeper;
use crate::cache::{KeyedCache, MemoryCache};
use crate::checksum::ChecksumService;
use crate::context::ContextId;
use crate::database::TransactionListener;
use crate::events::{EventSink, LedgerEvent};
use crate::lock::{wallet_lock_key, LockManager};
use crate::math::Math;
use crate::store::{RecordStore, WalletKey, WalletUpdate};
use crate::types::{Wallet, WalletState};
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Collaborators shared by every regulator
#[derive(Clone)]
pub struct RegulatorDeps {
    /// Committed balances
    pub bookkeeper: Arc<Bookkeeper>,
    /// Durable rows
    pub store: Arc<dyn RecordStore>,
    /// Wallet locks
    pub locks: Arc<LockManager>,
    /// Integrity stamps
    pub checksum: ChecksumService,
    /// Post-commit notifications
    pub sink: Arc<dyn EventSink>,
    /// Decimal engine
    pub math: Math,
}

impl std::fmt::Debug for RegulatorDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegulatorDeps")
            .field("checksum", &self.checksum)
            .field("math", &self.math)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Pending {
    forks: HashMap<Uuid, WalletState>,
    wallets: BTreeMap<Uuid, Wallet>,
    staged: BTreeMap<Uuid, (Wallet, WalletState)>,
}

/// Transaction-scoped pending ledger of one execution context
pub struct Regulator {
    deltas: MemoryCache<WalletState>,
    pending: Mutex<Pending>,
    deps: RegulatorDeps,
}

impl std::fmt::Debug for Regulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("Regulator")
            .field("forks", &pending.forks.len())
            .field("wallets", &pending.wallets.len())
            .field("staged", &pending.staged.len())
            .finish()
    }
}

impl Regulator {
    fn new(deps: RegulatorDeps) -> Self {
        Self {
            deltas: MemoryCache::new(None),
            pending: Mutex::new(Pending::default()),
            deps,
        }
    }

    /// Snapshot the committed state of wallets not forked yet
    pub fn seed(&self, wallets: &[Wallet]) -> Result<()> {
        let missing: Vec<Uuid> = {
            let pending = self.pending.lock();
            wallets
                .iter()
                .map(|wallet| wallet.uuid)
                .filter(|uuid| !pending.forks.contains_key(uuid))
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let states = self.deps.bookkeeper.multi_get(&missing)?;
        self.pending.lock().forks.extend(states);
        Ok(())
    }

    /// Discard snapshots; deltas survive
    pub fn drop_forks(&self, uuids: &[Uuid]) {
        let mut pending = self.pending.lock();
        for uuid in uuids {
            pending.forks.remove(uuid);
        }
    }

    /// Add to the balance delta; returns the effective balance
    pub fn increase(&self, wallet: &Wallet, value: &str, count: u64) -> Result<String> {
        let math = &self.deps.math;
        let mut delta = self.delta(&wallet.uuid);
        delta.balance = math.add(&delta.balance, value, Some(0))?;
        delta.transaction_count += count;
        self.store_delta(wallet, delta);
        self.get_balance(wallet)
    }

    /// Subtract from the balance delta; returns the effective balance
    pub fn decrease(&self, wallet: &Wallet, value: &str, count: u64) -> Result<String> {
        let negated = self.deps.math.negate(value)?;
        self.increase(wallet, &negated, count)
    }

    /// Freeze `value`, or the whole effective balance when `None`;
    /// returns the effective frozen amount
    pub fn freeze(&self, wallet: &Wallet, value: Option<&str>) -> Result<String> {
        let math = &self.deps.math;
        let frozen = self.get_frozen_amount(wallet)?;
        let change = match value {
            Some(value) => positive(math, value)?,
            None => {
                let rest = math.sub(&self.get_balance(wallet)?, &frozen, Some(0))?;
                math.max(&rest, "0")?
            }
        };

        let mut delta = self.delta(&wallet.uuid);
        delta.frozen_amount = math.add(&delta.frozen_amount, &change, Some(0))?;
        self.store_delta(wallet, delta);
        self.get_frozen_amount(wallet)
    }

    /// Unfreeze `value` (clamped to the frozen amount), or everything when
    /// `None`; returns the effective frozen amount
    pub fn un_freeze(&self, wallet: &Wallet, value: Option<&str>) -> Result<String> {
        let math = &self.deps.math;
        let frozen = self.get_frozen_amount(wallet)?;
        let change = match value {
            Some(value) => math.min(&positive(math, value)?, &frozen)?,
            None => frozen,
        };

        let mut delta = self.delta(&wallet.uuid);
        delta.frozen_amount = math.sub(&delta.frozen_amount, &change, Some(0))?;
        self.store_delta(wallet, delta);
        self.get_frozen_amount(wallet)
    }

    /// Committed balance plus delta
    pub fn get_balance(&self, wallet: &Wallet) -> Result<String> {
        let committed = self.committed_state(&wallet.uuid)?;
        let delta = self.delta(&wallet.uuid);
        self.deps.math.add(&committed.balance, &delta.balance, Some(0))
    }

    /// Committed frozen amount plus delta
    pub fn get_frozen_amount(&self, wallet: &Wallet) -> Result<String> {
        let committed = self.committed_state(&wallet.uuid)?;
        let delta = self.delta(&wallet.uuid);
        self.deps
            .math
            .add(&committed.frozen_amount, &delta.frozen_amount, Some(0))
    }

    /// `max(0, balance - frozen)`
    pub fn get_available_balance(&self, wallet: &Wallet) -> Result<String> {
        let math = &self.deps.math;
        let available = math.sub(
            &self.get_balance(wallet)?,
            &self.get_frozen_amount(wallet)?,
            Some(0),
        )?;
        math.max(&available, "0")
    }

    /// Committed transaction count plus delta
    pub fn get_transaction_count(&self, wallet: &Wallet) -> Result<u64> {
        let committed = self.committed_state(&wallet.uuid)?;
        Ok(committed.transaction_count + self.delta(&wallet.uuid).transaction_count)
    }

    /// Persist every changed wallet and verify the result
    pub fn committing(&self) -> Result<()> {
        let math = &self.deps.math;
        let wallets: Vec<Wallet> = self.pending.lock().wallets.values().cloned().collect();

        let mut updates = BTreeMap::new();
        let mut finals = HashMap::new();

        for wallet in wallets {
            let delta = self.delta(&wallet.uuid);
            if math.is_zero(&delta.balance)?
                && math.is_zero(&delta.frozen_amount)?
                && delta.transaction_count == 0
            {
                continue;
            }

            let committed = self.committed_state(&wallet.uuid)?;
            let state = WalletState {
                balance: math.add(&committed.balance, &delta.balance, Some(0))?,
                frozen_amount: math.add(&committed.frozen_amount, &delta.frozen_amount, Some(0))?,
                transaction_count: committed.transaction_count + delta.transaction_count,
            };
            // every balance change is a transaction, so the sum equals the balance
            let checksum = self.deps.checksum.wallet(
                &wallet.uuid,
                &state.balance,
                &state.frozen_amount,
                state.transaction_count,
                &state.balance,
            )?;

            updates.insert(
                wallet.id,
                WalletUpdate {
                    balance: state.balance.clone(),
                    frozen_amount: state.frozen_amount.clone(),
                    checksum,
                },
            );
            finals.insert(wallet.id, state);
        }

        if updates.is_empty() {
            return Ok(());
        }

        self.deps.store.batch_update_wallets(&updates)?;

        let keys: Vec<WalletKey> = updates.keys().map(|id| WalletKey::Id(*id)).collect();
        let rows = self.deps.store.multi_get_wallets(&keys)?;
        if rows.len() != keys.len() {
            return Err(Error::RecordNotFound(
                "wallet disappeared during reconciliation".to_string(),
            ));
        }

        let mut staged = BTreeMap::new();
        for row in rows {
            self.deps.checksum.verify_wallet(
                &row.wallet,
                row.transaction_count,
                &row.transaction_sum,
            )?;
            if let Some(state) = finals.remove(&row.wallet.id) {
                staged.insert(row.wallet.uuid, (row.wallet, state));
            }
        }

        tracing::debug!(wallets = staged.len(), "Pending balances reconciled");
        self.pending.lock().staged = staged;
        Ok(())
    }

    /// Publish staged states after the physical commit, then purge
    pub fn committed(&self) {
        let staged = std::mem::take(&mut self.pending.lock().staged);

        let states: HashMap<Uuid, WalletState> = staged
            .iter()
            .map(|(uuid, (_, state))| (*uuid, state.clone()))
            .collect();
        self.deps.bookkeeper.multi_sync(states);

        for (wallet, state) in staged.into_values() {
            self.deps.sink.dispatch(LedgerEvent::BalanceUpdated {
                wallet_id: wallet.id,
                wallet_uuid: wallet.uuid,
                balance: state.balance,
                frozen_amount: state.frozen_amount,
                updated_at: wallet.updated_at,
            });
        }

        self.deps.sink.flush();
        self.purge();
    }

    /// Drop all pending state and release the registered wallets' locks
    pub fn purge(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        self.deltas.flush();

        let keys: Vec<String> = pending.wallets.keys().map(wallet_lock_key).collect();
        if let Err(err) = self.deps.locks.releases(&keys) {
            tracing::warn!(error = %err, "Failed to release wallet locks on purge");
        }
        self.deps.sink.forget();
    }

    #[cfg(test)]
    pub(crate) fn has_fork(&self, uuid: &Uuid) -> bool {
        self.pending.lock().forks.contains_key(uuid)
    }

    fn committed_state(&self, uuid: &Uuid) -> Result<WalletState> {
        if let Some(fork) = self.pending.lock().forks.get(uuid) {
            return Ok(fork.clone());
        }
        self.deps.bookkeeper.get(uuid)
    }

    fn delta(&self, uuid: &Uuid) -> WalletState {
        self.deltas.get(&uuid.to_string()).unwrap_or_default()
    }

    fn store_delta(&self, wallet: &Wallet, delta: WalletState) {
        self.pending
            .lock()
            .wallets
            .entry(wallet.uuid)
            .or_insert_with(|| wallet.clone());
        self.deltas.set(&wallet.uuid.to_string(), delta, None);
    }
}

fn positive(math: &Math, value: &str) -> Result<String> {
    if math.compare(value, "0")? != Ordering::Greater {
        return Err(Error::invalid_amount(value));
    }
    math.strip_trailing_zeros(value)
}

/// Per-context regulator registry and transaction lifecycle driver
pub struct Regulators {
    instances: DashMap<ContextId, Arc<Regulator>>,
    deps: RegulatorDeps,
}

impl std::fmt::Debug for Regulators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Regulators")
            .field("active", &self.instances.len())
            .finish()
    }
}

impl Regulators {
    /// Create an empty registry
    pub fn new(deps: RegulatorDeps) -> Self {
        Self {
            instances: DashMap::new(),
            deps,
        }
    }

    /// Regulator of the calling context, created on demand
    pub fn current(&self) -> Arc<Regulator> {
        self.instances
            .entry(ContextId::current())
            .or_insert_with(|| Arc::new(Regulator::new(self.deps.clone())))
            .clone()
    }

    /// Regulator of the calling context, if one is active
    pub fn existing(&self) -> Option<Arc<Regulator>> {
        self.instances
            .get(&ContextId::current())
            .map(|regulator| regulator.clone())
    }

    fn take(&self) -> Option<Arc<Regulator>> {
        self.instances
            .remove(&ContextId::current())
            .map(|(_, regulator)| regulator)
    }
}

impl TransactionListener for Regulators {
    fn on_begin(&self) -> Result<()> {
        if let Some(regulator) = self.existing() {
            regulator.purge();
        }
        Ok(())
    }

    fn on_pre_commit(&self) -> Result<()> {
        match self.existing() {
            Some(regulator) => regulator.committing(),
            None => Ok(()),
        }
    }

    fn on_post_commit(&self) {
        match self.take() {
            Some(regulator) => regulator.committed(),
            None => self.deps.sink.flush(),
        }
        if let Err(err) = self.deps.locks.release_deferred() {
            tracing::warn!(error = %err, "Failed to release deferred locks");
        }
    }

    fn on_rollback(&self) {
        match self.take() {
            Some(regulator) => regulator.purge(),
            None => self.deps.sink.forget(),
        }
        if let Err(err) = self.deps.locks.release_deferred() {
            tracing::warn!(error = %err, "Failed to release deferred locks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChecksumConfig;
    use crate::events::EventDispatcher;
    use crate::lock::MemoryLockBackend;
    use crate::metrics::Metrics;
    use crate::store::{MemoryStore, WalletDraft, WalletLookup};
    use crate::types::Holder;
    use chrono::Utc;
    use std::time::Duration;

    fn deps() -> (RegulatorDeps, Arc<MemoryStore>) {
        let metrics = Metrics::new().unwrap();
        let math = Math::default();
        let store = Arc::new(MemoryStore::new());
        let checksum = ChecksumService::new(
            &ChecksumConfig {
                enabled: true,
                secret: "secret".to_string(),
            },
            math,
        );
        let locks = Arc::new(LockManager::new(
            Arc::new(MemoryLockBackend::new()),
            Duration::from_secs(5),
            Duration::from_secs(5),
            metrics.clone(),
        ));
        let bookkeeper = Arc::new(Bookkeeper::new(
            Arc::new(MemoryCache::default()),
            store.clone(),
            locks.clone(),
            checksum.clone(),
            None,
            metrics,
        ));
        let deps = RegulatorDeps {
            bookkeeper,
            store: store.clone(),
            locks,
            checksum,
            sink: Arc::new(EventDispatcher::new()),
            math,
        };
        (deps, store)
    }

    fn wallet(deps: &RegulatorDeps, store: &MemoryStore) -> Wallet {
        let uuid = Uuid::new_v4();
        store
            .create_wallet(WalletDraft {
                uuid,
                holder: Holder::new("user", "1"),
                name: "w".to_string(),
                slug: uuid.to_string(),
                description: None,
                decimal_places: 2,
                meta: None,
                checksum: deps.checksum.wallet(&uuid, "0", "0", 0, "0").unwrap(),
                created_at: Utc::now(),
            })
            .unwrap()
    }

    #[test]
    fn test_effective_balance_is_committed_plus_delta() {
        let (deps, store) = deps();
        let regulator = Regulator::new(deps.clone());
        let wallet = wallet(&deps, &store);

        assert_eq!(regulator.increase(&wallet, "1000", 1).unwrap(), "1000");
        assert_eq!(regulator.decrease(&wallet, "300", 1).unwrap(), "700");
        assert_eq!(regulator.get_transaction_count(&wallet).unwrap(), 2);
        // nothing reached the bookkeeper
        assert_eq!(deps.bookkeeper.get(&wallet.uuid).unwrap().balance, "0");
    }

    #[test]
    fn test_freeze_and_unfreeze() {
        let (deps, store) = deps();
        let regulator = Regulator::new(deps.clone());
        let wallet = wallet(&deps, &store);
        regulator.increase(&wallet, "1000", 1).unwrap();

        assert_eq!(regulator.freeze(&wallet, Some("400")).unwrap(), "400");
        assert_eq!(regulator.get_available_balance(&wallet).unwrap(), "600");

        // clamped to the frozen amount
        assert_eq!(regulator.un_freeze(&wallet, Some("1000")).unwrap(), "0");

        assert_eq!(regulator.freeze(&wallet, None).unwrap(), "1000");
        assert_eq!(regulator.get_available_balance(&wallet).unwrap(), "0");

        assert_eq!(regulator.un_freeze(&wallet, None).unwrap(), "0");
        assert_eq!(regulator.get_available_balance(&wallet).unwrap(), "1000");
    }

    #[test]
    fn test_freeze_rejects_non_positive_values() {
        let (deps, store) = deps();
        let regulator = Regulator::new(deps.clone());
        let wallet = wallet(&deps, &store);

        assert!(matches!(
            regulator.freeze(&wallet, Some("0")),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            regulator.un_freeze(&wallet, Some("-5")),
            Err(Error::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_available_is_floored_at_zero() {
        let (deps, store) = deps();
        let regulator = Regulator::new(deps.clone());
        let wallet = wallet(&deps, &store);

        regulator.freeze(&wallet, Some("50")).unwrap();
        assert_eq!(regulator.get_available_balance(&wallet).unwrap(), "0");
    }

    #[test]
    fn test_committing_then_committed() {
        let (deps, store) = deps();
        let regulator = Regulator::new(deps.clone());
        let wallet = wallet(&deps, &store);
        regulator.seed(std::slice::from_ref(&wallet)).unwrap();

        // a transaction row backs the delta so the aggregate matches
        store
            .create_transaction(crate::types::TransactionDraft {
                uuid: Uuid::now_v7(),
                wallet_id: wallet.id,
                kind: crate::types::TransactionKind::Deposit,
                amount: "250".to_string(),
                meta: None,
                checksum: None,
                created_at: Utc::now(),
            })
            .unwrap();
        regulator.increase(&wallet, "250", 1).unwrap();

        regulator.committing().unwrap();
        let row = store.find_wallet(&WalletLookup::Id(wallet.id)).unwrap().unwrap();
        assert_eq!(row.balance, "250");

        regulator.committed();
        assert_eq!(deps.bookkeeper.get(&wallet.uuid).unwrap().balance, "250");
        assert_eq!(regulator.get_balance(&wallet).unwrap(), "250");
    }

    #[test]
    fn test_committing_detects_unbacked_delta() {
        let (deps, store) = deps();
        let regulator = Regulator::new(deps.clone());
        let wallet = wallet(&deps, &store);

        // delta without a transaction row: aggregate disagrees with the stamp
        regulator.increase(&wallet, "10", 1).unwrap();
        assert!(matches!(
            regulator.committing(),
            Err(Error::WalletInconsistency(_))
        ));
    }

    #[test]
    fn test_purge_discards_deltas() {
        let (deps, store) = deps();
        let regulator = Regulator::new(deps.clone());
        let wallet = wallet(&deps, &store);

        regulator.increase(&wallet, "10", 1).unwrap();
        regulator.purge();
        assert_eq!(regulator.get_balance(&wallet).unwrap(), "0");
    }

    #[test]
    fn test_fork_is_stable_until_dropped() {
        let (deps, store) = deps();
        let regulator = Regulator::new(deps.clone());
        let wallet = wallet(&deps, &store);

        regulator.seed(std::slice::from_ref(&wallet)).unwrap();
        deps.bookkeeper.sync(
            &wallet.uuid,
            WalletState {
                balance: "99".to_string(),
                frozen_amount: "0".to_string(),
                transaction_count: 1,
            },
        );
        assert_eq!(regulator.get_balance(&wallet).unwrap(), "0");

        regulator.drop_forks(&[wallet.uuid]);
        assert_eq!(regulator.get_balance(&wallet).unwrap(), "99");
    }

    #[test]
    fn test_registry_is_per_context() {
        let (deps, _) = deps();
        let regulators = Arc::new(Regulators::new(deps));
        assert!(regulators.existing().is_none());
        let here = regulators.current();
        assert!(Arc::ptr_eq(&here, &regulators.current()));

        let other = regulators.clone();
        let seen = std::thread::spawn(move || other.existing().is_some())
            .join()
            .unwrap();
        assert!(!seen);
    }
}
