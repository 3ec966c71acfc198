//! Wallet Ledger
//!
//! Multi-wallet balance ledger with atomic, concurrency-safe deposits,
//! withdrawals and transfers over arbitrary-precision integer amounts.
//!
//! # Architecture
//!
//! - **Execution contexts**: every thread is its own context; locks and
//!   pending changes belong to the context that made them
//! - **Atomic blocks**: wallets are locked, mutated in a pending ledger and
//!   published only after the host transaction commits
//! - **Bookkeeper**: committed balances are cached and reloaded from the
//!   record store on a miss
//! - **Checksums**: HMAC-SHA256 stamps on wallets, transactions and transfers
//!
//! # Invariants
//!
//! - Committed balance == Σ(committed transaction amounts) per wallet
//! - Available balance == max(0, balance - frozen)
//! - Pending changes are visible only to the context that made them
//! - Rolled-back work leaves no balance, event or row behind

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod atomic;
pub mod bookkeeper;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod events;
pub mod ledger;
pub mod lock;
pub mod math;
pub mod metrics;
pub mod operations;
pub mod regulator;
pub mod store;
pub mod types;

// Re-exports
pub use config::Config;
pub use database::{Outcome, TransactionListener};
pub use error::{Error, Result};
pub use events::{EventDispatcher, EventKind, EventListener, EventSink, LedgerEvent};
pub use ledger::{Ledger, LedgerBuilder};
pub use math::Math;
pub use store::{MemoryStore, RecordStore, WalletLookup};
pub use types::{
    BatchOperation, Holder, NewWallet, Transaction, TransactionKind, Transfer, Wallet,
    WalletState,
};
