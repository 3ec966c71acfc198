//! Record store
//!
//! Durable rows for wallets, transactions and transfers. The ledger only
//! talks to the [`RecordStore`] trait; [`MemoryStore`] is the in-process
//! reference implementation.
//!
//! # Transactions
//!
//! Each execution context has at most one physical transaction. Inside it,
//! writes go to a per-context journal:
//! - the owning context reads its own writes
//! - other contexts see nothing until commit
//! - commit applies the journal under a single table write
//! - rollback discards it
//!
//! Outside a transaction every write is applied immediately.

use crate::context::ContextId;
use crate::math::Math;
use crate::types::{
    Holder, Transaction, TransactionDraft, TransactionId, Transfer, TransferDraft, TransferId,
    Wallet, WalletId,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Wallet lookup criteria
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletLookup {
    /// By surrogate id
    Id(WalletId),
    /// By stable identity
    Uuid(Uuid),
    /// By holder and slug
    Slug {
        /// Owner
        holder: Holder,
        /// Slug unique per holder
        slug: String,
    },
}

/// Key of a batch wallet read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalletKey {
    /// By surrogate id
    Id(WalletId),
    /// By stable identity
    Uuid(Uuid),
}

/// Wallet row to insert
#[derive(Debug, Clone, PartialEq)]
pub struct WalletDraft {
    /// Stable identity
    pub uuid: Uuid,
    /// Owner
    pub holder: Holder,
    /// Display name
    pub name: String,
    /// Unique per holder
    pub slug: String,
    /// Description
    pub description: Option<String>,
    /// Fractional digits
    pub decimal_places: u32,
    /// Host metadata
    pub meta: Option<serde_json::Value>,
    /// Stamp of the zero state
    pub checksum: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Balance columns written at reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletUpdate {
    /// Raw balance
    pub balance: String,
    /// Raw frozen amount
    pub frozen_amount: String,
    /// New stamp
    pub checksum: Option<String>,
}

/// Wallet row with its transaction aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct WalletAggregate {
    /// Persisted row
    pub wallet: Wallet,
    /// Number of live transactions
    pub transaction_count: u64,
    /// Sum of live transaction amounts
    pub transaction_sum: String,
}

/// Durable storage for ledger records
pub trait RecordStore: Send + Sync {
    /// Open the calling context's physical transaction
    fn begin(&self) -> Result<()>;

    /// Commit the calling context's physical transaction
    fn commit(&self) -> Result<()>;

    /// Discard the calling context's physical transaction
    fn rollback(&self) -> Result<()>;

    /// Insert a wallet; duplicate holder+slug is rejected
    fn create_wallet(&self, draft: WalletDraft) -> Result<Wallet>;

    /// Find a live (not soft-deleted) wallet
    fn find_wallet(&self, lookup: &WalletLookup) -> Result<Option<Wallet>>;

    /// Mark a wallet deleted
    fn soft_delete_wallet(&self, id: WalletId) -> Result<Wallet>;

    /// Update balance columns of many wallets in one atomic call
    fn batch_update_wallets(&self, updates: &BTreeMap<WalletId, WalletUpdate>) -> Result<()>;

    /// Live wallets with their transaction aggregates; absent keys are skipped
    fn multi_get_wallets(&self, keys: &[WalletKey]) -> Result<Vec<WalletAggregate>>;

    /// Like [`multi_get_wallets`](Self::multi_get_wallets), but only committed
    /// rows, ignoring the calling context's open transaction
    fn multi_get_committed_wallets(&self, keys: &[WalletKey]) -> Result<Vec<WalletAggregate>>;

    /// Insert one transaction
    fn create_transaction(&self, draft: TransactionDraft) -> Result<Transaction>;

    /// Insert many transactions in one call, preserving order
    fn insert_transactions(&self, drafts: Vec<TransactionDraft>) -> Result<Vec<Transaction>>;

    /// Insert one transfer
    fn create_transfer(&self, draft: TransferDraft) -> Result<Transfer>;

    /// Insert many transfers in one call, preserving order
    fn insert_transfers(&self, drafts: Vec<TransferDraft>) -> Result<Vec<Transfer>>;

    /// Transactions by UUID; absent ones are skipped
    fn multi_get_transactions(&self, uuids: &[Uuid]) -> Result<Vec<Transaction>>;

    /// Transfers by UUID; absent ones are skipped
    fn multi_get_transfers(&self, uuids: &[Uuid]) -> Result<Vec<Transfer>>;

    /// Replace a transaction's metadata
    fn update_transaction_meta(
        &self,
        uuid: &Uuid,
        meta: Option<serde_json::Value>,
    ) -> Result<Transaction>;
}

#[derive(Debug, Default)]
struct Tables {
    wallets: BTreeMap<WalletId, Wallet>,
    transactions: BTreeMap<TransactionId, Transaction>,
    transfers: BTreeMap<TransferId, Transfer>,

    wallet_by_uuid: HashMap<Uuid, WalletId>,
    wallet_by_slug: HashMap<(Holder, String), WalletId>,
    transaction_by_uuid: HashMap<Uuid, TransactionId>,
    transactions_by_wallet: HashMap<WalletId, Vec<TransactionId>>,
    transfer_by_uuid: HashMap<Uuid, TransferId>,
}

impl Tables {
    fn apply(&mut self, journal: Journal) -> Result<()> {
        // validate everything before touching anything
        for wallet in journal.wallets.values() {
            let key = (wallet.holder.clone(), wallet.slug.clone());
            if let Some(existing) = self.wallet_by_slug.get(&key) {
                if *existing != wallet.id {
                    return Err(duplicate_slug(&wallet.holder, &wallet.slug));
                }
            }
        }

        for (id, wallet) in journal.wallets {
            self.wallet_by_uuid.insert(wallet.uuid, id);
            self.wallet_by_slug
                .insert((wallet.holder.clone(), wallet.slug.clone()), id);
            self.wallets.insert(id, wallet);
        }

        for (id, transaction) in journal.transactions {
            if !self.transactions.contains_key(&id) {
                self.transaction_by_uuid.insert(transaction.uuid, id);
                self.transactions_by_wallet
                    .entry(transaction.wallet_id)
                    .or_default()
                    .push(id);
            }
            self.transactions.insert(id, transaction);
        }

        for (id, transfer) in journal.transfers {
            self.transfer_by_uuid.insert(transfer.uuid, id);
            self.transfers.insert(id, transfer);
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct Journal {
    wallets: BTreeMap<WalletId, Wallet>,
    transactions: BTreeMap<TransactionId, Transaction>,
    transfers: BTreeMap<TransferId, Transfer>,
}

impl Journal {
    fn is_empty(&self) -> bool {
        self.wallets.is_empty() && self.transactions.is_empty() && self.transfers.is_empty()
    }
}

/// Read view of one context: its journal layered over the shared tables
struct View<'a> {
    tables: &'a Tables,
    journal: Option<&'a Journal>,
}

impl<'a> View<'a> {
    fn wallet(&self, id: WalletId) -> Option<&'a Wallet> {
        self.journal
            .and_then(|journal| journal.wallets.get(&id))
            .or_else(|| self.tables.wallets.get(&id))
    }

    fn wallet_by(&self, lookup: &WalletLookup) -> Option<&'a Wallet> {
        match lookup {
            WalletLookup::Id(id) => self.wallet(*id),
            WalletLookup::Uuid(uuid) => self
                .journal
                .and_then(|journal| journal.wallets.values().find(|w| w.uuid == *uuid))
                .or_else(|| {
                    self.tables
                        .wallet_by_uuid
                        .get(uuid)
                        .and_then(|id| self.wallet(*id))
                }),
            WalletLookup::Slug { holder, slug } => self
                .journal
                .and_then(|journal| {
                    journal
                        .wallets
                        .values()
                        .find(|w| w.holder == *holder && w.slug == *slug)
                })
                .or_else(|| {
                    self.tables
                        .wallet_by_slug
                        .get(&(holder.clone(), slug.clone()))
                        .and_then(|id| self.wallet(*id))
                }),
        }
    }

    fn transaction(&self, id: TransactionId) -> Option<&'a Transaction> {
        self.journal
            .and_then(|journal| journal.transactions.get(&id))
            .or_else(|| self.tables.transactions.get(&id))
    }

    fn transaction_by_uuid(&self, uuid: &Uuid) -> Option<&'a Transaction> {
        self.journal
            .and_then(|journal| journal.transactions.values().find(|t| t.uuid == *uuid))
            .or_else(|| {
                self.tables
                    .transaction_by_uuid
                    .get(uuid)
                    .and_then(|id| self.transaction(*id))
            })
    }

    fn transfer_by_uuid(&self, uuid: &Uuid) -> Option<&'a Transfer> {
        self.journal
            .and_then(|journal| journal.transfers.values().find(|t| t.uuid == *uuid))
            .or_else(|| {
                self.tables
                    .transfer_by_uuid
                    .get(uuid)
                    .and_then(|id| self.tables.transfers.get(id))
            })
    }

    fn transactions_of(&self, wallet_id: WalletId) -> BTreeMap<TransactionId, &'a Transaction> {
        let mut rows = BTreeMap::new();
        if let Some(ids) = self.tables.transactions_by_wallet.get(&wallet_id) {
            for id in ids {
                if let Some(transaction) = self.transaction(*id) {
                    rows.insert(*id, transaction);
                }
            }
        }
        if let Some(journal) = self.journal {
            for transaction in journal.transactions.values() {
                if transaction.wallet_id == wallet_id {
                    rows.insert(transaction.id, transaction);
                }
            }
        }
        rows
    }
}

/// In-memory [`RecordStore`]
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    journals: DashMap<ContextId, Journal>,
    next_wallet_id: AtomicU64,
    next_transaction_id: AtomicU64,
    next_transfer_id: AtomicU64,
    math: Math,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            journals: DashMap::new(),
            next_wallet_id: AtomicU64::new(1),
            next_transaction_id: AtomicU64::new(1),
            next_transfer_id: AtomicU64::new(1),
            math: Math::default(),
        }
    }

    /// Whether the calling context has an open transaction
    pub fn in_transaction(&self) -> bool {
        self.journals.contains_key(&ContextId::current())
    }

    /// Number of committed wallets, soft-deleted included
    pub fn wallet_count(&self) -> usize {
        self.tables.read().wallets.len()
    }

    /// Number of committed transactions
    pub fn transaction_count(&self) -> usize {
        self.tables.read().transactions.len()
    }

    /// Number of committed transfers
    pub fn transfer_count(&self) -> usize {
        self.tables.read().transfers.len()
    }

    // Journal shard locks are always taken before the table lock.

    fn read<R>(&self, f: impl FnOnce(&View<'_>) -> Result<R>) -> Result<R> {
        let journal = self.journals.get(&ContextId::current());
        let tables = self.tables.read();
        let view = View {
            tables: &tables,
            journal: journal.as_deref(),
        };
        f(&view)
    }

    fn write<R>(&self, f: impl FnOnce(&View<'_>, &mut Journal) -> Result<R>) -> Result<R> {
        let context = ContextId::current();
        if let Some(mut journal) = self.journals.get_mut(&context) {
            let tables = self.tables.read();
            let mut staged = Journal::default();
            let result = {
                let view = View {
                    tables: &tables,
                    journal: Some(&*journal),
                };
                f(&view, &mut staged)?
            };
            journal.wallets.extend(staged.wallets);
            journal.transactions.extend(staged.transactions);
            journal.transfers.extend(staged.transfers);
            return Ok(result);
        }

        // autocommit
        let mut tables = self.tables.write();
        let mut staged = Journal::default();
        let result = {
            let view = View {
                tables: &tables,
                journal: None,
            };
            f(&view, &mut staged)?
        };
        tables.apply(staged)?;
        Ok(result)
    }

    fn aggregates(&self, view: &View<'_>, keys: &[WalletKey]) -> Result<Vec<WalletAggregate>> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let lookup = match key {
                WalletKey::Id(id) => WalletLookup::Id(*id),
                WalletKey::Uuid(uuid) => WalletLookup::Uuid(*uuid),
            };
            if let Some(wallet) = view.wallet_by(&lookup).filter(|w| !w.is_deleted()) {
                rows.push(self.aggregate(view, wallet)?);
            }
        }
        Ok(rows)
    }

    fn aggregate(&self, view: &View<'_>, wallet: &Wallet) -> Result<WalletAggregate> {
        let mut count = 0u64;
        let mut sum = "0".to_string();
        for transaction in view.transactions_of(wallet.id).values() {
            if transaction.deleted_at.is_some() {
                continue;
            }
            count += 1;
            sum = self.math.add(&sum, &transaction.amount, Some(0))?;
        }
        Ok(WalletAggregate {
            wallet: wallet.clone(),
            transaction_count: count,
            transaction_sum: sum,
        })
    }

    fn stage_transactions(
        &self,
        view: &View<'_>,
        staged: &mut Journal,
        drafts: Vec<TransactionDraft>,
    ) -> Result<Vec<Transaction>> {
        let mut created = Vec::with_capacity(drafts.len());
        for draft in drafts {
            if view.wallet(draft.wallet_id).is_none() {
                return Err(Error::RecordNotFound(format!("wallet #{}", draft.wallet_id)));
            }
            if view.transaction_by_uuid(&draft.uuid).is_some() {
                return Err(Error::Storage(format!("duplicate transaction {}", draft.uuid)));
            }
            let id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
            let transaction = Transaction::from_draft(id, draft);
            staged.transactions.insert(id, transaction.clone());
            created.push(transaction);
        }
        Ok(created)
    }

    fn stage_transfers(
        &self,
        view: &View<'_>,
        staged: &mut Journal,
        drafts: Vec<TransferDraft>,
    ) -> Result<Vec<Transfer>> {
        let mut created = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let legs = [draft.deposit_id, draft.withdraw_id];
            for leg in legs {
                let present = view.transaction(leg).is_some()
                    || staged.transactions.contains_key(&leg);
                if !present {
                    return Err(Error::RecordNotFound(format!("transaction #{}", leg)));
                }
            }
            let id = self.next_transfer_id.fetch_add(1, Ordering::SeqCst);
            let transfer = Transfer::from_draft(id, draft);
            staged.transfers.insert(id, transfer.clone());
            created.push(transfer);
        }
        Ok(created)
    }
}

impl RecordStore for MemoryStore {
    fn begin(&self) -> Result<()> {
        let context = ContextId::current();
        if self.journals.contains_key(&context) {
            return Err(Error::Storage(format!(
                "context {} already has an open transaction",
                context
            )));
        }
        self.journals.insert(context, Journal::default());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let context = ContextId::current();
        let (_, journal) = self
            .journals
            .remove(&context)
            .ok_or_else(|| Error::Storage("commit without an open transaction".to_string()))?;

        if journal.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write();
        tables.apply(journal)
    }

    fn rollback(&self) -> Result<()> {
        let context = ContextId::current();
        if self.journals.remove(&context).is_none() {
            tracing::debug!(%context, "Rollback without an open transaction");
        }
        Ok(())
    }

    fn create_wallet(&self, draft: WalletDraft) -> Result<Wallet> {
        self.write(|view, staged| {
            let lookup = WalletLookup::Slug {
                holder: draft.holder.clone(),
                slug: draft.slug.clone(),
            };
            if view.wallet_by(&lookup).is_some() {
                return Err(duplicate_slug(&draft.holder, &draft.slug));
            }
            if view.wallet_by(&WalletLookup::Uuid(draft.uuid)).is_some() {
                return Err(Error::Storage(format!("duplicate wallet {}", draft.uuid)));
            }

            let id = self.next_wallet_id.fetch_add(1, Ordering::SeqCst);
            let wallet = Wallet {
                id,
                uuid: draft.uuid,
                holder: draft.holder,
                name: draft.name,
                slug: draft.slug,
                description: draft.description,
                decimal_places: draft.decimal_places,
                balance: "0".to_string(),
                frozen_amount: "0".to_string(),
                checksum: draft.checksum,
                meta: draft.meta,
                created_at: draft.created_at,
                updated_at: draft.created_at,
                deleted_at: None,
            };
            staged.wallets.insert(id, wallet.clone());
            Ok(wallet)
        })
    }

    fn find_wallet(&self, lookup: &WalletLookup) -> Result<Option<Wallet>> {
        self.read(|view| {
            Ok(view
                .wallet_by(lookup)
                .filter(|wallet| !wallet.is_deleted())
                .cloned())
        })
    }

    fn soft_delete_wallet(&self, id: WalletId) -> Result<Wallet> {
        self.write(|view, staged| {
            let mut wallet = view
                .wallet(id)
                .filter(|wallet| !wallet.is_deleted())
                .cloned()
                .ok_or_else(|| Error::RecordNotFound(format!("wallet #{}", id)))?;
            let now = Utc::now();
            wallet.deleted_at = Some(now);
            wallet.updated_at = now;
            staged.wallets.insert(id, wallet.clone());
            Ok(wallet)
        })
    }

    fn batch_update_wallets(&self, updates: &BTreeMap<WalletId, WalletUpdate>) -> Result<()> {
        self.write(|view, staged| {
            let now = Utc::now();
            for (id, update) in updates {
                let mut wallet = view
                    .wallet(*id)
                    .cloned()
                    .ok_or_else(|| Error::RecordNotFound(format!("wallet #{}", id)))?;
                wallet.balance = update.balance.clone();
                wallet.frozen_amount = update.frozen_amount.clone();
                wallet.checksum = update.checksum.clone();
                wallet.updated_at = now;
                staged.wallets.insert(*id, wallet);
            }
            Ok(())
        })
    }

    fn multi_get_wallets(&self, keys: &[WalletKey]) -> Result<Vec<WalletAggregate>> {
        self.read(|view| self.aggregates(view, keys))
    }

    fn multi_get_committed_wallets(&self, keys: &[WalletKey]) -> Result<Vec<WalletAggregate>> {
        let tables = self.tables.read();
        let view = View {
            tables: &tables,
            journal: None,
        };
        self.aggregates(&view, keys)
    }

    fn create_transaction(&self, draft: TransactionDraft) -> Result<Transaction> {
        self.write(|view, staged| {
            let mut created = self.stage_transactions(view, staged, vec![draft])?;
            created
                .pop()
                .ok_or_else(|| Error::Storage("transaction insert returned no row".to_string()))
        })
    }

    fn insert_transactions(&self, drafts: Vec<TransactionDraft>) -> Result<Vec<Transaction>> {
        self.write(|view, staged| self.stage_transactions(view, staged, drafts))
    }

    fn create_transfer(&self, draft: TransferDraft) -> Result<Transfer> {
        self.write(|view, staged| {
            let mut created = self.stage_transfers(view, staged, vec![draft])?;
            created
                .pop()
                .ok_or_else(|| Error::Storage("transfer insert returned no row".to_string()))
        })
    }

    fn insert_transfers(&self, drafts: Vec<TransferDraft>) -> Result<Vec<Transfer>> {
        self.write(|view, staged| self.stage_transfers(view, staged, drafts))
    }

    fn multi_get_transactions(&self, uuids: &[Uuid]) -> Result<Vec<Transaction>> {
        self.read(|view| {
            Ok(uuids
                .iter()
                .filter_map(|uuid| view.transaction_by_uuid(uuid).cloned())
                .collect())
        })
    }

    fn multi_get_transfers(&self, uuids: &[Uuid]) -> Result<Vec<Transfer>> {
        self.read(|view| {
            Ok(uuids
                .iter()
                .filter_map(|uuid| view.transfer_by_uuid(uuid).cloned())
                .collect())
        })
    }

    fn update_transaction_meta(
        &self,
        uuid: &Uuid,
        meta: Option<serde_json::Value>,
    ) -> Result<Transaction> {
        self.write(|view, staged| {
            let mut transaction = view
                .transaction_by_uuid(uuid)
                .cloned()
                .ok_or_else(|| Error::RecordNotFound(format!("transaction {}", uuid)))?;
            transaction.meta = meta;
            transaction.updated_at = Utc::now();
            staged.transactions.insert(transaction.id, transaction.clone());
            Ok(transaction)
        })
    }
}

fn duplicate_slug(holder: &Holder, slug: &str) -> Error {
    Error::Storage(format!("wallet slug '{}' already exists for {}", slug, holder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionKind;

    fn wallet_draft(slug: &str) -> WalletDraft {
        WalletDraft {
            uuid: Uuid::new_v4(),
            holder: Holder::new("user", "1"),
            name: slug.to_string(),
            slug: slug.to_string(),
            description: None,
            decimal_places: 2,
            meta: None,
            checksum: None,
            created_at: Utc::now(),
        }
    }

    fn deposit(wallet_id: WalletId, amount: &str) -> TransactionDraft {
        TransactionDraft {
            uuid: Uuid::now_v7(),
            wallet_id,
            kind: TransactionKind::Deposit,
            amount: amount.to_string(),
            meta: None,
            checksum: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_and_find_wallet() {
        let store = MemoryStore::new();
        let wallet = store.create_wallet(wallet_draft("main")).unwrap();
        assert_eq!(wallet.balance, "0");

        let by_id = store.find_wallet(&WalletLookup::Id(wallet.id)).unwrap();
        let by_uuid = store.find_wallet(&WalletLookup::Uuid(wallet.uuid)).unwrap();
        let by_slug = store
            .find_wallet(&WalletLookup::Slug {
                holder: Holder::new("user", "1"),
                slug: "main".to_string(),
            })
            .unwrap();
        assert_eq!(by_id.as_ref(), Some(&wallet));
        assert_eq!(by_uuid.as_ref(), Some(&wallet));
        assert_eq!(by_slug.as_ref(), Some(&wallet));
    }

    #[test]
    fn test_duplicate_slug_rejected() {
        let store = MemoryStore::new();
        store.create_wallet(wallet_draft("main")).unwrap();
        assert!(matches!(
            store.create_wallet(wallet_draft("main")),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn test_soft_delete_hides_wallet() {
        let store = MemoryStore::new();
        let wallet = store.create_wallet(wallet_draft("main")).unwrap();
        let deleted = store.soft_delete_wallet(wallet.id).unwrap();
        assert!(deleted.is_deleted());
        assert_eq!(store.find_wallet(&WalletLookup::Id(wallet.id)).unwrap(), None);
        assert_eq!(store.wallet_count(), 1);
    }

    #[test]
    fn test_aggregate_counts_and_sums() {
        let store = MemoryStore::new();
        let wallet = store.create_wallet(wallet_draft("main")).unwrap();
        store
            .insert_transactions(vec![deposit(wallet.id, "1000"), deposit(wallet.id, "-250")])
            .unwrap();

        let rows = store.multi_get_wallets(&[WalletKey::Uuid(wallet.uuid)]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].transaction_count, 2);
        assert_eq!(rows[0].transaction_sum, "750");
    }

    #[test]
    fn test_journal_read_your_writes_and_rollback() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let wallet = store.create_wallet(wallet_draft("main")).unwrap();

        store.begin().unwrap();
        assert!(store.in_transaction());
        store.create_transaction(deposit(wallet.id, "10")).unwrap();

        let own = store.multi_get_wallets(&[WalletKey::Id(wallet.id)]).unwrap();
        assert_eq!(own[0].transaction_count, 1);

        let other = {
            let store = store.clone();
            std::thread::spawn(move || {
                store.multi_get_wallets(&[WalletKey::Id(wallet.id)]).unwrap()
            })
            .join()
            .unwrap()
        };
        assert_eq!(other[0].transaction_count, 0);

        let committed = store
            .multi_get_committed_wallets(&[WalletKey::Id(wallet.id)])
            .unwrap();
        assert_eq!(committed[0].transaction_count, 0);
        assert_eq!(committed[0].transaction_sum, "0");

        store.rollback().unwrap();
        assert!(!store.in_transaction());
        assert_eq!(store.transaction_count(), 0);
    }

    #[test]
    fn test_commit_applies_journal() {
        let store = MemoryStore::new();
        let wallet = store.create_wallet(wallet_draft("main")).unwrap();

        store.begin().unwrap();
        store.create_transaction(deposit(wallet.id, "10")).unwrap();
        let updates = BTreeMap::from([(
            wallet.id,
            WalletUpdate {
                balance: "10".to_string(),
                frozen_amount: "0".to_string(),
                checksum: None,
            },
        )]);
        store.batch_update_wallets(&updates).unwrap();
        store.commit().unwrap();

        assert_eq!(store.transaction_count(), 1);
        let found = store.find_wallet(&WalletLookup::Id(wallet.id)).unwrap().unwrap();
        assert_eq!(found.balance, "10");
    }

    #[test]
    fn test_nested_begin_rejected() {
        let store = MemoryStore::new();
        store.begin().unwrap();
        assert!(matches!(store.begin(), Err(Error::Storage(_))));
        store.rollback().unwrap();
    }

    #[test]
    fn test_meta_update_does_not_double_count() {
        let store = MemoryStore::new();
        let wallet = store.create_wallet(wallet_draft("main")).unwrap();
        let tx = store.create_transaction(deposit(wallet.id, "5")).unwrap();

        store.begin().unwrap();
        let updated = store
            .update_transaction_meta(&tx.uuid, Some(serde_json::json!({"a": 1})))
            .unwrap();
        assert_eq!(updated.meta, Some(serde_json::json!({"a": 1})));
        let rows = store.multi_get_wallets(&[WalletKey::Id(wallet.id)]).unwrap();
        assert_eq!(rows[0].transaction_count, 1);
        store.commit().unwrap();

        let stored = store.multi_get_transactions(&[tx.uuid]).unwrap();
        assert_eq!(stored[0].meta, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn test_transfer_requires_existing_legs() {
        let store = MemoryStore::new();
        let draft = TransferDraft {
            uuid: Uuid::now_v7(),
            from_id: 1,
            to_id: 2,
            deposit_id: 41,
            withdraw_id: 42,
            amount: "1".to_string(),
            fee: "0".to_string(),
            decimal_places: 2,
            meta: None,
            checksum: None,
            created_at: Utc::now(),
        };
        assert!(matches!(
            store.create_transfer(draft),
            Err(Error::RecordNotFound(_))
        ));
    }
}
