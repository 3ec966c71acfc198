//! Core types for the ledger
//!
//! Amounts are decimal strings throughout:
//! - raw amounts are integers scaled by the wallet's decimal places
//! - human amounts are plain decimals
//!
//! Records are immutable once written, apart from wallet balances (owned by
//! the pending ledger's reconciliation) and transaction metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Surrogate wallet id assigned by the record store
pub type WalletId = u64;

/// Surrogate transaction id assigned by the record store
pub type TransactionId = u64;

/// Surrogate transfer id assigned by the record store
pub type TransferId = u64;

/// Owning entity of a wallet
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Holder {
    /// Entity type (e.g. `user`, `merchant`)
    pub kind: String,
    /// Entity id within its type
    pub id: String,
}

impl Holder {
    /// Create holder reference
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Wallet row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Surrogate id
    pub id: WalletId,

    /// Stable identity
    pub uuid: Uuid,

    /// Owner
    pub holder: Holder,

    /// Display name
    pub name: String,

    /// Unique per holder
    pub slug: String,

    /// Free-form description
    pub description: Option<String>,

    /// Fractional digits of the wallet's human unit
    pub decimal_places: u32,

    /// Persisted raw balance
    pub balance: String,

    /// Persisted raw frozen amount
    pub frozen_amount: String,

    /// Integrity stamp (absent while checksums are disabled)
    pub checksum: Option<String>,

    /// Host metadata
    pub meta: Option<serde_json::Value>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Soft-deletion marker
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Wallet {
    /// Whether the wallet was soft-deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Input for wallet creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWallet {
    /// Owner
    pub holder: Holder,

    /// Display name (configured default when absent)
    pub name: Option<String>,

    /// Slug (derived from the name when absent)
    pub slug: Option<String>,

    /// Description
    pub description: Option<String>,

    /// Fractional digits (configured default when absent)
    pub decimal_places: Option<u32>,

    /// Host metadata
    pub meta: Option<serde_json::Value>,
}

impl NewWallet {
    /// Wallet for `holder` with every attribute defaulted
    pub fn new(holder: Holder) -> Self {
        Self {
            holder,
            name: None,
            slug: None,
            description: None,
            decimal_places: None,
            meta: None,
        }
    }

    /// Set the display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the slug
    pub fn slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the decimal places
    pub fn decimal_places(mut self, decimal_places: u32) -> Self {
        self.decimal_places = Some(decimal_places);
        self
    }

    /// Set host metadata
    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Direction of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Credit
    Deposit,
    /// Debit (stored with a negative amount)
    Withdraw,
}

impl TransactionKind {
    /// Canonical name, also used in checksums
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated transaction awaiting persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDraft {
    /// Time-ordered identity (UUIDv7)
    pub uuid: Uuid,

    /// Target wallet
    pub wallet_id: WalletId,

    /// Direction
    pub kind: TransactionKind,

    /// Signed raw amount
    pub amount: String,

    /// Host metadata
    pub meta: Option<serde_json::Value>,

    /// Integrity stamp computed at creation
    pub checksum: Option<String>,

    /// Creation timestamp (covered by the checksum)
    pub created_at: DateTime<Utc>,
}

/// Persisted transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Surrogate id
    pub id: TransactionId,

    /// Time-ordered identity (UUIDv7)
    pub uuid: Uuid,

    /// Target wallet
    pub wallet_id: WalletId,

    /// Direction
    pub kind: TransactionKind,

    /// Signed raw amount
    pub amount: String,

    /// Host metadata
    pub meta: Option<serde_json::Value>,

    /// Integrity stamp
    pub checksum: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Soft-deletion marker
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Materialize a draft under the id the store assigned
    pub fn from_draft(id: TransactionId, draft: TransactionDraft) -> Self {
        Self {
            id,
            uuid: draft.uuid,
            wallet_id: draft.wallet_id,
            kind: draft.kind,
            amount: draft.amount,
            meta: draft.meta,
            checksum: draft.checksum,
            created_at: draft.created_at,
            updated_at: draft.created_at,
            deleted_at: None,
        }
    }
}

/// Validated transfer awaiting persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDraft {
    /// Time-ordered identity (UUIDv7)
    pub uuid: Uuid,

    /// Source wallet
    pub from_id: WalletId,

    /// Destination wallet
    pub to_id: WalletId,

    /// Deposit leg on the destination
    pub deposit_id: TransactionId,

    /// Withdrawal leg on the source
    pub withdraw_id: TransactionId,

    /// Raw amount at `decimal_places`
    pub amount: String,

    /// Raw fee at `decimal_places`
    pub fee: String,

    /// `min(source, destination)` decimal places
    pub decimal_places: u32,

    /// Host metadata
    pub meta: Option<serde_json::Value>,

    /// Integrity stamp
    pub checksum: Option<String>,

    /// Creation timestamp (covered by the checksum)
    pub created_at: DateTime<Utc>,
}

/// Persisted transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    /// Surrogate id
    pub id: TransferId,

    /// Time-ordered identity (UUIDv7)
    pub uuid: Uuid,

    /// Source wallet
    pub from_id: WalletId,

    /// Destination wallet
    pub to_id: WalletId,

    /// Deposit leg on the destination
    pub deposit_id: TransactionId,

    /// Withdrawal leg on the source
    pub withdraw_id: TransactionId,

    /// Raw amount at `decimal_places`
    pub amount: String,

    /// Raw fee at `decimal_places`
    pub fee: String,

    /// Precision of `amount` and `fee`
    pub decimal_places: u32,

    /// Host metadata
    pub meta: Option<serde_json::Value>,

    /// Integrity stamp
    pub checksum: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Soft-deletion marker
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Transfer {
    /// Materialize a draft under the id the store assigned
    pub fn from_draft(id: TransferId, draft: TransferDraft) -> Self {
        Self {
            id,
            uuid: draft.uuid,
            from_id: draft.from_id,
            to_id: draft.to_id,
            deposit_id: draft.deposit_id,
            withdraw_id: draft.withdraw_id,
            amount: draft.amount,
            fee: draft.fee,
            decimal_places: draft.decimal_places,
            meta: draft.meta,
            checksum: draft.checksum,
            created_at: draft.created_at,
            updated_at: draft.created_at,
            deleted_at: None,
        }
    }
}

/// Balance, frozen amount and transaction count of one wallet
///
/// The same shape serves as a committed snapshot (bookkeeper) and as a
/// pending delta (regulator). The two are only combined on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletState {
    /// Raw balance (or delta)
    pub balance: String,

    /// Raw frozen amount (or delta)
    pub frozen_amount: String,

    /// Transaction count (or delta)
    pub transaction_count: u64,
}

impl WalletState {
    /// All-zero state
    pub fn zero() -> Self {
        Self {
            balance: "0".to_string(),
            frozen_amount: "0".to_string(),
            transaction_count: 0,
        }
    }
}

impl Default for WalletState {
    fn default() -> Self {
        Self::zero()
    }
}

/// One entry of a batch applied with [`crate::Ledger::apply`]
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOperation {
    /// Target wallet
    pub wallet: Wallet,

    /// Direction
    pub kind: TransactionKind,

    /// Positive raw amount
    pub amount: String,

    /// Host metadata
    pub meta: Option<serde_json::Value>,
}

impl BatchOperation {
    /// Deposit entry
    pub fn deposit(wallet: &Wallet, amount: impl Into<String>) -> Self {
        Self {
            wallet: wallet.clone(),
            kind: TransactionKind::Deposit,
            amount: amount.into(),
            meta: None,
        }
    }

    /// Withdrawal entry
    pub fn withdraw(wallet: &Wallet, amount: impl Into<String>) -> Self {
        Self {
            wallet: wallet.clone(),
            kind: TransactionKind::Withdraw,
            amount: amount.into(),
            meta: None,
        }
    }

    /// Attach metadata
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_kind_serde() {
        assert_eq!(
            serde_json::to_string(&TransactionKind::Withdraw).unwrap(),
            "\"withdraw\""
        );
        let kind: TransactionKind = serde_json::from_str("\"deposit\"").unwrap();
        assert_eq!(kind, TransactionKind::Deposit);
        assert_eq!(kind.to_string(), "deposit");
    }

    #[test]
    fn test_new_wallet_builder() {
        let input = NewWallet::new(Holder::new("user", "42"))
            .name("Savings")
            .decimal_places(4);

        assert_eq!(input.holder.to_string(), "user:42");
        assert_eq!(input.name.as_deref(), Some("Savings"));
        assert_eq!(input.slug, None);
        assert_eq!(input.decimal_places, Some(4));
    }

    #[test]
    fn test_transaction_from_draft() {
        let draft = TransactionDraft {
            uuid: Uuid::now_v7(),
            wallet_id: 7,
            kind: TransactionKind::Withdraw,
            amount: "-150".to_string(),
            meta: Some(serde_json::json!({"order": 1})),
            checksum: None,
            created_at: Utc::now(),
        };

        let tx = Transaction::from_draft(3, draft.clone());
        assert_eq!(tx.id, 3);
        assert_eq!(tx.uuid, draft.uuid);
        assert_eq!(tx.amount, "-150");
        assert_eq!(tx.updated_at, draft.created_at);
        assert!(tx.deleted_at.is_none());
    }

    #[test]
    fn test_wallet_state_zero() {
        let state = WalletState::default();
        assert_eq!(state.balance, "0");
        assert_eq!(state.frozen_amount, "0");
        assert_eq!(state.transaction_count, 0);
    }
}
