//! Main ledger orchestration layer
//!
//! This module ties together the record store, balance caches, locks and
//! operations into the public wallet API.
//!
//! # Example
//!
//! ```no_run
//! use wallet_ledger::{Holder, Ledger, NewWallet};
//!
//! fn main() -> wallet_ledger::Result<()> {
//!     let ledger = Ledger::in_memory()?;
//!     let wallet = ledger.create_wallet(NewWallet::new(Holder::new("user", "42")))?;
//!
//!     ledger.deposit(&wallet, "1000", None)?;
//!     ledger.withdraw(&wallet, "250", None)?;
//!     assert_eq!(ledger.balance(&wallet)?, "750");
//!
//!     Ok(())
//! }
//! ```

use crate::{
    atomic::AtomicCoordinator,
    bookkeeper::Bookkeeper,
    cache::{KeyedCache, MemoryCache},
    checksum::ChecksumService,
    config::LockDriver,
    database::{Database, Outcome, TransactionListener},
    events::{EventDispatcher, EventListener, EventSink, LedgerEvent},
    lock::{wallet_lock_key, CacheLockBackend, LockBackend, LockManager, MemoryLockBackend},
    math::Math,
    metrics::Metrics,
    operations::Operations,
    regulator::{RegulatorDeps, Regulators},
    store::{MemoryStore, RecordStore, WalletDraft, WalletKey, WalletLookup},
    types::{
        BatchOperation, Holder, NewWallet, Transaction, TransactionKind, Transfer, Wallet,
        WalletState,
    },
    Config, Error, Result,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

struct Inner {
    config: Config,
    math: Math,
    store: Arc<dyn RecordStore>,
    db: Arc<Database>,
    locks: Arc<LockManager>,
    bookkeeper: Arc<Bookkeeper>,
    regulators: Arc<Regulators>,
    atomic: Arc<AtomicCoordinator>,
    operations: Operations,
    checksum: ChecksumService,
    sink: Arc<dyn EventSink>,
    metrics: Metrics,
}

/// Main ledger interface
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Explicit wiring of a [`Ledger`]
///
/// Every collaborator defaults to its in-process implementation.
#[derive(Default)]
pub struct LedgerBuilder {
    config: Config,
    store: Option<Arc<dyn RecordStore>>,
    cache: Option<Arc<dyn KeyedCache<WalletState>>>,
    lock_backend: Option<Arc<dyn LockBackend>>,
    sink: Option<Arc<dyn EventSink>>,
    listeners: Vec<Arc<dyn EventListener>>,
    transaction_listeners: Vec<Arc<dyn TransactionListener>>,
}

impl std::fmt::Debug for LedgerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerBuilder")
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl LedgerBuilder {
    /// Use `config`
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a host record store
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a host cache for committed balances
    pub fn cache(mut self, cache: Arc<dyn KeyedCache<WalletState>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a host lock backend, overriding `lock.driver`
    pub fn lock_backend(mut self, backend: Arc<dyn LockBackend>) -> Self {
        self.lock_backend = Some(backend);
        self
    }

    /// Use a host event sink
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Deliver events to `listener` (built-in dispatcher only)
    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Hook into the host transaction lifecycle
    pub fn transaction_listener(mut self, listener: Arc<dyn TransactionListener>) -> Self {
        self.transaction_listeners.push(listener);
        self
    }

    /// Wire everything together
    pub fn build(self) -> Result<Ledger> {
        let config = self.config;
        config.validate()?;

        let metrics = Metrics::new()?;
        let math = Math::new(config.math.scale);
        let checksum = ChecksumService::new(&config.checksum, math).with_metrics(metrics.clone());

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let lock_backend = self.lock_backend.unwrap_or_else(|| match config.lock.driver {
            LockDriver::Memory => Arc::new(MemoryLockBackend::new()),
            LockDriver::Cache => Arc::new(CacheLockBackend::new(Arc::new(
                MemoryCache::<String>::default(),
            ))),
        });
        let locks = Arc::new(LockManager::new(
            lock_backend,
            config.lock.ttl(),
            config.lock.timeout(),
            metrics.clone(),
        ));

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new(config.cache.ttl())));
        let bookkeeper = Arc::new(Bookkeeper::new(
            cache,
            store.clone(),
            locks.clone(),
            checksum.clone(),
            config.cache.ttl(),
            metrics.clone(),
        ));

        let sink: Arc<dyn EventSink> = match self.sink {
            Some(_) if !self.listeners.is_empty() => {
                return Err(Error::Config(
                    "event listeners need the built-in dispatcher".to_string(),
                ));
            }
            Some(sink) => sink,
            None => {
                let dispatcher = EventDispatcher::new();
                for listener in self.listeners {
                    dispatcher.subscribe(listener);
                }
                Arc::new(dispatcher)
            }
        };

        let db = Arc::new(Database::new(store.clone(), metrics.clone()));
        let regulators = Arc::new(Regulators::new(RegulatorDeps {
            bookkeeper: bookkeeper.clone(),
            store: store.clone(),
            locks: locks.clone(),
            checksum: checksum.clone(),
            sink: sink.clone(),
            math,
        }));
        db.add_listener(regulators.clone());
        for listener in self.transaction_listeners {
            db.add_listener(listener);
        }

        let atomic = Arc::new(AtomicCoordinator::new(
            db.clone(),
            locks.clone(),
            regulators.clone(),
        ));
        let operations = Operations::new(
            store.clone(),
            regulators.clone(),
            atomic.clone(),
            checksum.clone(),
            sink.clone(),
            math,
            metrics.clone(),
        );

        tracing::info!(
            checksums = checksum.is_enabled(),
            lock_driver = ?config.lock.driver,
            scale = config.math.scale,
            "Wallet ledger ready"
        );

        Ok(Ledger {
            inner: Arc::new(Inner {
                config,
                math,
                store,
                db,
                locks,
                bookkeeper,
                regulators,
                atomic,
                operations,
                checksum,
                sink,
                metrics,
            }),
        })
    }
}

impl Ledger {
    /// Start wiring a ledger
    pub fn builder() -> LedgerBuilder {
        LedgerBuilder::default()
    }

    /// Ledger with in-process collaborators and `config`
    pub fn new(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Ledger with in-process collaborators and default configuration
    pub fn in_memory() -> Result<Self> {
        Self::new(Config::default())
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Decimal engine at the configured scale
    pub fn math(&self) -> &Math {
        &self.inner.math
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Record store
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    /// Transaction wrapper
    pub fn database(&self) -> &Arc<Database> {
        &self.inner.db
    }

    /// Committed balance cache
    pub fn bookkeeper(&self) -> &Arc<Bookkeeper> {
        &self.inner.bookkeeper
    }

    /// Ledger operations
    pub fn operations(&self) -> &Operations {
        &self.inner.operations
    }

    // =========================================================================
    // Wallets
    // =========================================================================

    /// Create a wallet
    ///
    /// Missing attributes come from the `wallet` configuration section; a
    /// missing slug is derived from the name.
    pub fn create_wallet(&self, input: NewWallet) -> Result<Wallet> {
        let draft = self.wallet_draft(input);
        let inner = &self.inner;

        inner.db.transaction(|| {
            let checksum = inner.checksum.wallet(&draft.uuid, "0", "0", 0, "0")?;
            let wallet = inner.store.create_wallet(WalletDraft {
                checksum,
                ..draft.clone()
            })?;

            inner.sink.dispatch(LedgerEvent::WalletCreated {
                wallet_id: wallet.id,
                wallet_uuid: wallet.uuid,
                holder: wallet.holder.clone(),
                slug: wallet.slug.clone(),
                created_at: wallet.created_at,
            });
            tracing::info!(
                wallet = %wallet.uuid,
                holder = %wallet.holder,
                slug = %wallet.slug,
                "Wallet created"
            );
            Ok(wallet)
        })
    }

    /// Wallet of `holder` with `slug`
    pub fn find_wallet(&self, holder: &Holder, slug: &str) -> Result<Option<Wallet>> {
        self.inner.store.find_wallet(&WalletLookup::Slug {
            holder: holder.clone(),
            slug: slug.to_string(),
        })
    }

    /// Wallet by UUID
    pub fn find_wallet_by_uuid(&self, uuid: &Uuid) -> Result<Option<Wallet>> {
        self.inner.store.find_wallet(&WalletLookup::Uuid(*uuid))
    }

    /// Wallet by any lookup, `RecordNotFound` when absent
    pub fn get_wallet(&self, lookup: &WalletLookup) -> Result<Wallet> {
        self.inner
            .store
            .find_wallet(lookup)?
            .ok_or_else(|| Error::RecordNotFound(format!("wallet {:?}", lookup)))
    }

    /// Existing wallet with the resolved slug, or a new one
    pub fn find_or_create_wallet(&self, input: NewWallet) -> Result<Wallet> {
        let slug = self.resolve_slug(&input);
        match self.find_wallet(&input.holder, &slug)? {
            Some(wallet) => Ok(wallet),
            None => self.create_wallet(input),
        }
    }

    /// Soft-delete a wallet
    pub fn delete_wallet(&self, wallet: &Wallet) -> Result<Wallet> {
        let inner = &self.inner;
        let deleted = inner
            .atomic
            .block(wallet, || inner.store.soft_delete_wallet(wallet.id))?;
        inner.bookkeeper.forget(&wallet.uuid);
        tracing::info!(wallet = %wallet.uuid, "Wallet deleted");
        Ok(deleted)
    }

    // =========================================================================
    // Balances
    // =========================================================================

    /// Effective raw balance
    ///
    /// Inside an atomic block this includes the calling context's pending
    /// changes; otherwise it is the committed balance.
    pub fn balance(&self, wallet: &Wallet) -> Result<String> {
        match self.inner.regulators.existing() {
            Some(regulator) => regulator.get_balance(wallet),
            None => Ok(self.inner.bookkeeper.get(&wallet.uuid)?.balance),
        }
    }

    /// Effective raw frozen amount
    pub fn frozen_amount(&self, wallet: &Wallet) -> Result<String> {
        match self.inner.regulators.existing() {
            Some(regulator) => regulator.get_frozen_amount(wallet),
            None => Ok(self.inner.bookkeeper.get(&wallet.uuid)?.frozen_amount),
        }
    }

    /// `max(0, balance - frozen)`
    pub fn available_balance(&self, wallet: &Wallet) -> Result<String> {
        match self.inner.regulators.existing() {
            Some(regulator) => regulator.get_available_balance(wallet),
            None => {
                let state = self.inner.bookkeeper.get(&wallet.uuid)?;
                let math = &self.inner.math;
                let available = math.sub(&state.balance, &state.frozen_amount, Some(0))?;
                math.max(&available, "0")
            }
        }
    }

    /// Effective transaction count
    pub fn transaction_count(&self, wallet: &Wallet) -> Result<u64> {
        match self.inner.regulators.existing() {
            Some(regulator) => regulator.get_transaction_count(wallet),
            None => Ok(self.inner.bookkeeper.get(&wallet.uuid)?.transaction_count),
        }
    }

    /// Effective balance in human units
    pub fn balance_float(&self, wallet: &Wallet) -> Result<String> {
        let balance = self.balance(wallet)?;
        self.inner.math.from_unscaled(&balance, wallet.decimal_places)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Credit `amount` raw units
    pub fn deposit(
        &self,
        wallet: &Wallet,
        amount: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Transaction> {
        self.inner.operations.deposit(wallet, amount, meta)
    }

    /// Debit `amount` raw units
    pub fn withdraw(
        &self,
        wallet: &Wallet,
        amount: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Transaction> {
        self.inner.operations.withdraw(wallet, amount, meta, false)
    }

    /// Debit `amount` raw units without funds checks; the balance may go
    /// negative
    pub fn force_withdraw(
        &self,
        wallet: &Wallet,
        amount: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Transaction> {
        self.inner.operations.withdraw(wallet, amount, meta, true)
    }

    /// Credit a human amount (extra digits are truncated)
    pub fn deposit_float(
        &self,
        wallet: &Wallet,
        amount: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Transaction> {
        let raw = self.inner.math.to_unscaled(amount, wallet.decimal_places)?;
        self.deposit(wallet, &raw, meta)
    }

    /// Debit a human amount (extra digits are truncated)
    pub fn withdraw_float(
        &self,
        wallet: &Wallet,
        amount: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Transaction> {
        let raw = self.inner.math.to_unscaled(amount, wallet.decimal_places)?;
        self.withdraw(wallet, &raw, meta)
    }

    /// Move `amount` raw units, charging `fee` on the deposit leg
    pub fn transfer(
        &self,
        from: &Wallet,
        to: &Wallet,
        amount: &str,
        fee: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Transfer> {
        self.inner.operations.transfer(from, to, amount, fee, meta)
    }

    /// Move a human amount at the lower precision of the two wallets
    pub fn transfer_float(
        &self,
        from: &Wallet,
        to: &Wallet,
        amount: &str,
        fee: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Transfer> {
        let math = &self.inner.math;
        let decimal_places = from.decimal_places.min(to.decimal_places);
        let amount = math.to_unscaled(amount, decimal_places)?;
        let fee = math.to_unscaled(fee, decimal_places)?;
        self.transfer(from, to, &amount, &fee, meta)
    }

    /// Freeze `amount` raw units, or the whole balance when `None`;
    /// returns the frozen amount
    pub fn freeze(&self, wallet: &Wallet, amount: Option<&str>) -> Result<String> {
        let inner = &self.inner;
        let frozen = inner
            .atomic
            .block(wallet, || inner.regulators.current().freeze(wallet, amount))?;
        tracing::info!(wallet = %wallet.uuid, frozen = %frozen, "Funds frozen");
        Ok(frozen)
    }

    /// Unfreeze `amount` raw units, or everything when `None`; returns the
    /// frozen amount
    pub fn unfreeze(&self, wallet: &Wallet, amount: Option<&str>) -> Result<String> {
        let inner = &self.inner;
        let frozen = inner
            .atomic
            .block(wallet, || inner.regulators.current().un_freeze(wallet, amount))?;
        tracing::info!(wallet = %wallet.uuid, frozen = %frozen, "Funds unfrozen");
        Ok(frozen)
    }

    /// Apply mixed deposits and withdrawals in one atomic block
    ///
    /// Funds are checked once per wallet against the batch's net effect, so
    /// a deposit can cover a withdrawal of the same batch.
    pub fn apply(&self, batch: Vec<BatchOperation>) -> Result<Vec<Transaction>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let inner = &self.inner;
        let wallets: Vec<Wallet> = batch.iter().map(|op| op.wallet.clone()).collect();

        inner.atomic.blocks(&wallets, || {
            let math = &inner.math;
            let operations = &inner.operations;

            let mut nets: Vec<(Wallet, String, bool)> = Vec::new();
            for op in &batch {
                let amount = operations.positive_integer(&op.amount)?;
                let signed = match op.kind {
                    TransactionKind::Deposit => amount,
                    TransactionKind::Withdraw => math.negate(&amount)?,
                };
                let withdraws = op.kind == TransactionKind::Withdraw;

                match nets.iter_mut().find(|(wallet, _, _)| wallet.uuid == op.wallet.uuid) {
                    Some((_, net, has_withdrawal)) => {
                        *net = math.add(net, &signed, Some(0))?;
                        *has_withdrawal |= withdraws;
                    }
                    None => nets.push((op.wallet.clone(), signed, withdraws)),
                }
            }

            for (wallet, net, has_withdrawal) in &nets {
                if *has_withdrawal && math.is_negative(net)? {
                    operations.ensure_funds(wallet, &math.abs(net)?)?;
                }
            }

            let mut entries = Vec::with_capacity(batch.len());
            for op in batch {
                let draft =
                    operations.make_transaction(&op.wallet, op.kind, &op.amount, op.meta, true)?;
                entries.push((op.wallet, draft));
            }
            operations.apply(entries)
        })
    }

    // =========================================================================
    // Atomic blocks and transactions
    // =========================================================================

    /// Run `f` with `wallet` locked inside the host transaction
    pub fn block<R>(&self, wallet: &Wallet, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.inner.atomic.block(wallet, f)
    }

    /// Run `f` with every wallet locked inside the host transaction
    pub fn blocks<R>(&self, wallets: &[Wallet], f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.inner.atomic.blocks(wallets, f)
    }

    /// Whether the calling context holds the wallet's lock
    pub fn is_blocked(&self, wallet: &Wallet) -> bool {
        self.inner.locks.is_blocked(&wallet_lock_key(&wallet.uuid))
    }

    /// Run `f` in a host transaction
    pub fn transaction<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.inner.db.transaction(f)
    }

    /// Run `f` in a host transaction that may ask for a silent rollback
    pub fn transaction_with<R>(&self, f: impl FnOnce() -> Result<Outcome<R>>) -> Result<R> {
        self.inner.db.transaction_with(f)
    }

    // =========================================================================
    // Audit
    // =========================================================================

    /// Check a wallet's persisted state against its stamp
    pub fn verify_wallet(&self, wallet: &Wallet) -> Result<()> {
        let row = self
            .inner
            .store
            .multi_get_committed_wallets(&[WalletKey::Id(wallet.id)])?
            .pop()
            .ok_or_else(|| Error::RecordNotFound(format!("wallet {}", wallet.uuid)))?;
        self.inner
            .checksum
            .verify_wallet(&row.wallet, row.transaction_count, &row.transaction_sum)
    }

    /// Check a transaction against its stamp
    pub fn verify_transaction(&self, uuid: &Uuid) -> Result<()> {
        let transaction = self.get_transaction(uuid)?;
        self.inner.checksum.verify_transaction(&transaction)
    }

    /// Check a transfer against its stamp
    pub fn verify_transfer(&self, uuid: &Uuid) -> Result<()> {
        let transfer = self
            .inner
            .store
            .multi_get_transfers(std::slice::from_ref(uuid))?
            .pop()
            .ok_or_else(|| Error::RecordNotFound(format!("transfer {}", uuid)))?;
        self.inner.checksum.verify_transfer(&transfer)
    }

    /// Transaction by UUID
    pub fn get_transaction(&self, uuid: &Uuid) -> Result<Transaction> {
        self.inner
            .store
            .multi_get_transactions(std::slice::from_ref(uuid))?
            .pop()
            .ok_or_else(|| Error::RecordNotFound(format!("transaction {}", uuid)))
    }

    /// Replace a transaction's metadata
    pub fn set_transaction_meta(
        &self,
        uuid: &Uuid,
        meta: Option<serde_json::Value>,
    ) -> Result<Transaction> {
        let inner = &self.inner;
        inner
            .db
            .transaction(|| inner.store.update_transaction_meta(uuid, meta))
    }

    fn resolve_slug(&self, input: &NewWallet) -> String {
        let defaults = &self.inner.config.wallet;
        let derived = match (&input.slug, &input.name) {
            (Some(slug), _) => slug.clone(),
            (None, Some(name)) => slugify(name),
            (None, None) => defaults.default_slug.clone(),
        };
        if derived.is_empty() {
            defaults.default_slug.clone()
        } else {
            derived
        }
    }

    fn wallet_draft(&self, input: NewWallet) -> WalletDraft {
        let defaults = &self.inner.config.wallet;
        let slug = self.resolve_slug(&input);
        WalletDraft {
            uuid: Uuid::now_v7(),
            name: input.name.unwrap_or_else(|| defaults.default_name.clone()),
            slug,
            holder: input.holder,
            description: input.description,
            decimal_places: input.decimal_places.unwrap_or(defaults.decimal_places),
            meta: input.meta,
            checksum: None,
            created_at: Utc::now(),
        }
    }
}

/// Lowercase ASCII slug; runs of other characters collapse to `-`
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if dash && !slug.is_empty() {
                slug.push('-');
            }
            dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            dash = true;
        }
    }
    slug
}
