//! Deposit, withdrawal and transfer records
//!
//! Every mutation runs inside an atomic block over the wallets it touches,
//! validates against the effective (pending-aware) balance, persists through
//! the record store and feeds the pending ledger.

use crate::atomic::AtomicCoordinator;
use crate::checksum::ChecksumService;
use crate::events::{EventSink, LedgerEvent};
use crate::math::Math;
use crate::metrics::Metrics;
use crate::regulator::Regulators;
use crate::store::RecordStore;
use crate::types::{Transaction, TransactionDraft, TransactionKind, Transfer, TransferDraft, Wallet};
use crate::{Error, Result};
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Ledger operations
pub struct Operations {
    store: Arc<dyn RecordStore>,
    regulators: Arc<Regulators>,
    atomic: Arc<AtomicCoordinator>,
    checksum: ChecksumService,
    sink: Arc<dyn EventSink>,
    math: Math,
    metrics: Metrics,
}

impl std::fmt::Debug for Operations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operations")
            .field("math", &self.math)
            .finish_non_exhaustive()
    }
}

impl Operations {
    /// Create the operation set
    pub fn new(
        store: Arc<dyn RecordStore>,
        regulators: Arc<Regulators>,
        atomic: Arc<AtomicCoordinator>,
        checksum: ChecksumService,
        sink: Arc<dyn EventSink>,
        math: Math,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            regulators,
            atomic,
            checksum,
            sink,
            math,
            metrics,
        }
    }

    /// Validate and build an immutable transaction draft
    ///
    /// `amount` must be a positive raw integer. Unless `forced`, a
    /// withdrawal needs a non-zero effective balance and enough available
    /// funds. Withdrawals are stored negated.
    pub fn make_transaction(
        &self,
        wallet: &Wallet,
        kind: TransactionKind,
        amount: &str,
        meta: Option<serde_json::Value>,
        forced: bool,
    ) -> Result<TransactionDraft> {
        let amount = self.positive_integer(amount)?;

        let amount = match kind {
            TransactionKind::Deposit => amount,
            TransactionKind::Withdraw => {
                if !forced {
                    self.ensure_funds(wallet, &amount)?;
                }
                self.math.negate(&amount)?
            }
        };

        let uuid = Uuid::now_v7();
        let created_at = Utc::now();
        let checksum = self
            .checksum
            .transaction(&uuid, wallet.id, kind, &amount, &created_at)?;

        Ok(TransactionDraft {
            uuid,
            wallet_id: wallet.id,
            kind,
            amount,
            meta,
            checksum,
            created_at,
        })
    }

    /// Persist drafts and feed their deltas to the pending ledger
    pub fn apply(&self, entries: Vec<(Wallet, TransactionDraft)>) -> Result<Vec<Transaction>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let wallets: Vec<Wallet> = entries.iter().map(|(wallet, _)| wallet.clone()).collect();

        self.atomic.blocks(&wallets, move || {
            let mut touched: Vec<Wallet> = Vec::new();
            let mut drafts = Vec::with_capacity(entries.len());
            for (wallet, draft) in entries {
                if !touched.iter().any(|w| w.id == wallet.id) {
                    touched.push(wallet);
                }
                drafts.push(draft);
            }

            let created = if drafts.len() == 1 {
                drafts
                    .into_iter()
                    .map(|draft| self.store.create_transaction(draft))
                    .collect::<Result<Vec<_>>>()?
            } else {
                self.store.insert_transactions(drafts)?
            };

            let mut sums: BTreeMap<u64, (String, u64)> = BTreeMap::new();
            for transaction in &created {
                let entry = sums
                    .entry(transaction.wallet_id)
                    .or_insert_with(|| ("0".to_string(), 0));
                entry.0 = self.math.add(&entry.0, &transaction.amount, Some(0))?;
                entry.1 += 1;
            }

            let regulator = self.regulators.current();
            for wallet in &touched {
                if let Some((sum, count)) = sums.get(&wallet.id) {
                    regulator.increase(wallet, sum, *count)?;
                }
            }

            for transaction in &created {
                self.metrics.record_transactions(transaction.kind, 1);
                self.sink.dispatch(LedgerEvent::TransactionCreated {
                    transaction_id: transaction.id,
                    transaction_uuid: transaction.uuid,
                    wallet_id: transaction.wallet_id,
                    kind: transaction.kind,
                    amount: transaction.amount.clone(),
                    created_at: transaction.created_at,
                });
            }

            Ok(created)
        })
    }

    /// Credit `amount` raw units
    pub fn deposit(
        &self,
        wallet: &Wallet,
        amount: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Transaction> {
        self.single(wallet, TransactionKind::Deposit, amount, meta, false)
    }

    /// Debit `amount` raw units; `forced` skips the funds checks
    pub fn withdraw(
        &self,
        wallet: &Wallet,
        amount: &str,
        meta: Option<serde_json::Value>,
        forced: bool,
    ) -> Result<Transaction> {
        self.single(wallet, TransactionKind::Withdraw, amount, meta, forced)
    }

    /// Move `amount` from `from` to `to`, charging `fee` on the deposit leg
    ///
    /// `amount` and `fee` are raw units at the lower decimal precision of
    /// the two wallets.
    pub fn transfer(
        &self,
        from: &Wallet,
        to: &Wallet,
        amount: &str,
        fee: &str,
        meta: Option<serde_json::Value>,
    ) -> Result<Transfer> {
        let wallets = [from.clone(), to.clone()];

        self.atomic.blocks(&wallets, || {
            let decimal_places = from.decimal_places.min(to.decimal_places);
            let amount = self.positive_integer(amount)?;
            let fee = self.non_negative_integer(fee)?;

            let net = self.math.sub(&amount, &fee, Some(0))?;
            if !self.math.is_positive(&net)? {
                return Err(Error::InvalidAmount(format!(
                    "fee {} consumes the whole transfer amount {}",
                    fee, amount
                )));
            }

            let withdrawn = self.rescale(&amount, decimal_places, from.decimal_places)?;
            let deposited = self.rescale(&net, decimal_places, to.decimal_places)?;

            let withdraw = self.make_transaction(
                from,
                TransactionKind::Withdraw,
                &withdrawn,
                meta.clone(),
                false,
            )?;
            let deposit =
                self.make_transaction(to, TransactionKind::Deposit, &deposited, meta.clone(), false)?;

            let created = self.apply(vec![(from.clone(), withdraw), (to.clone(), deposit)])?;
            let (withdraw, deposit) = match created.as_slice() {
                [withdraw, deposit] => (withdraw, deposit),
                _ => {
                    return Err(Error::Storage(
                        "transfer legs were not persisted".to_string(),
                    ))
                }
            };

            let uuid = Uuid::now_v7();
            let created_at = Utc::now();
            let checksum = self
                .checksum
                .transfer(&uuid, from.id, to.id, &amount, &fee, &created_at)?;

            let transfer = self.store.create_transfer(TransferDraft {
                uuid,
                from_id: from.id,
                to_id: to.id,
                deposit_id: deposit.id,
                withdraw_id: withdraw.id,
                amount,
                fee,
                decimal_places,
                meta,
                checksum,
                created_at,
            })?;

            self.metrics.record_transfer();
            self.sink.dispatch(LedgerEvent::TransferCreated {
                transfer_id: transfer.id,
                transfer_uuid: transfer.uuid,
                from_id: transfer.from_id,
                to_id: transfer.to_id,
                amount: transfer.amount.clone(),
                fee: transfer.fee.clone(),
                created_at: transfer.created_at,
            });
            tracing::info!(
                transfer = %transfer.uuid,
                from = %from.uuid,
                to = %to.uuid,
                amount = %transfer.amount,
                fee = %transfer.fee,
                "Transfer recorded"
            );

            Ok(transfer)
        })
    }

    /// Reject a withdrawal the effective balance cannot cover
    pub(crate) fn ensure_funds(&self, wallet: &Wallet, amount: &str) -> Result<()> {
        let regulator = self.regulators.current();

        let balance = regulator.get_balance(wallet)?;
        if self.math.is_zero(&balance)? {
            return Err(Error::BalanceIsEmpty {
                wallet: wallet.uuid.to_string(),
            });
        }

        let available = regulator.get_available_balance(wallet)?;
        if self.math.compare(&available, amount)? == Ordering::Less {
            return Err(Error::InsufficientFunds {
                wallet: wallet.uuid.to_string(),
                available,
                requested: amount.to_string(),
            });
        }

        Ok(())
    }

    /// Canonical positive raw integer
    pub(crate) fn positive_integer(&self, amount: &str) -> Result<String> {
        let canonical = self
            .math
            .strip_trailing_zeros(amount)
            .map_err(|_| Error::invalid_amount(amount))?;
        if !self.math.is_integer(&canonical)? || !self.math.is_positive(&canonical)? {
            return Err(Error::invalid_amount(amount));
        }
        Ok(canonical)
    }

    fn non_negative_integer(&self, amount: &str) -> Result<String> {
        let canonical = self
            .math
            .strip_trailing_zeros(amount)
            .map_err(|_| Error::invalid_amount(amount))?;
        if !self.math.is_integer(&canonical)? || self.math.is_negative(&canonical)? {
            return Err(Error::invalid_amount(amount));
        }
        Ok(canonical)
    }

    fn rescale(&self, raw: &str, from_places: u32, to_places: u32) -> Result<String> {
        let human = self.math.from_unscaled(raw, from_places)?;
        self.math.to_unscaled(&human, to_places)
    }

    fn single(
        &self,
        wallet: &Wallet,
        kind: TransactionKind,
        amount: &str,
        meta: Option<serde_json::Value>,
        forced: bool,
    ) -> Result<Transaction> {
        self.atomic.block(wallet, || {
            let draft = self.make_transaction(wallet, kind, amount, meta, forced)?;
            let mut created = self.apply(vec![(wallet.clone(), draft)])?;
            let transaction = created
                .pop()
                .ok_or_else(|| Error::Storage("transaction was not persisted".to_string()))?;

            tracing::debug!(
                wallet = %wallet.uuid,
                kind = %kind,
                amount = %transaction.amount,
                "Transaction recorded"
            );
            Ok(transaction)
        })
    }
}
