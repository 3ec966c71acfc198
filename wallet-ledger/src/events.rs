//! Ledger events and ordered dispatch
//!
//! Events are queued per execution context while a host transaction runs
//! and delivered only after it commits. On flush, the queue is grouped by
//! event kind in first-dispatch order, each kind keeping its enqueue order.
//! A rollback forgets the queue.

use crate::context::ContextId;
use crate::types::{Holder, TransactionId, TransactionKind, TransferId, WalletId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Discriminant of a [`LedgerEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Wallet row inserted
    WalletCreated,
    /// Committed balance of a wallet changed
    BalanceUpdated,
    /// Transaction row inserted
    TransactionCreated,
    /// Transfer row inserted
    TransferCreated,
}

/// Notification emitted after commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// Wallet row inserted
    WalletCreated {
        /// Wallet id
        wallet_id: WalletId,
        /// Wallet UUID
        wallet_uuid: Uuid,
        /// Owner
        holder: Holder,
        /// Slug
        slug: String,
        /// Creation time
        created_at: DateTime<Utc>,
    },
    /// Committed balance of a wallet changed
    BalanceUpdated {
        /// Wallet id
        wallet_id: WalletId,
        /// Wallet UUID
        wallet_uuid: Uuid,
        /// New raw balance
        balance: String,
        /// New raw frozen amount
        frozen_amount: String,
        /// Reconciliation time
        updated_at: DateTime<Utc>,
    },
    /// Transaction row inserted
    TransactionCreated {
        /// Transaction id
        transaction_id: TransactionId,
        /// Transaction UUID
        transaction_uuid: Uuid,
        /// Target wallet
        wallet_id: WalletId,
        /// Direction
        kind: TransactionKind,
        /// Signed raw amount
        amount: String,
        /// Creation time
        created_at: DateTime<Utc>,
    },
    /// Transfer row inserted
    TransferCreated {
        /// Transfer id
        transfer_id: TransferId,
        /// Transfer UUID
        transfer_uuid: Uuid,
        /// Source wallet
        from_id: WalletId,
        /// Destination wallet
        to_id: WalletId,
        /// Raw amount
        amount: String,
        /// Raw fee
        fee: String,
        /// Creation time
        created_at: DateTime<Utc>,
    },
}

impl LedgerEvent {
    /// Discriminant
    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::WalletCreated { .. } => EventKind::WalletCreated,
            LedgerEvent::BalanceUpdated { .. } => EventKind::BalanceUpdated,
            LedgerEvent::TransactionCreated { .. } => EventKind::TransactionCreated,
            LedgerEvent::TransferCreated { .. } => EventKind::TransferCreated,
        }
    }
}

/// Receiver of delivered events
pub trait EventListener: Send + Sync {
    /// Handle one event
    fn handle(&self, event: &LedgerEvent);
}

impl<F> EventListener for F
where
    F: Fn(&LedgerEvent) + Send + Sync,
{
    fn handle(&self, event: &LedgerEvent) {
        self(event)
    }
}

/// Per-context event queue
pub trait EventSink: Send + Sync {
    /// Queue an event for the calling context
    fn dispatch(&self, event: LedgerEvent);

    /// Deliver the calling context's queue exactly once
    fn flush(&self);

    /// Discard the calling context's queue
    fn forget(&self);
}

/// In-process [`EventSink`] fanning out to registered listeners
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    queues: DashMap<ContextId, Vec<LedgerEvent>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.read().len())
            .field("queued_contexts", &self.queues.len())
            .finish()
    }
}

impl EventDispatcher {
    /// Create a dispatcher without listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Events queued by the calling context
    pub fn pending(&self) -> usize {
        self.queues
            .get(&ContextId::current())
            .map_or(0, |queue| queue.len())
    }
}

impl EventSink for EventDispatcher {
    fn dispatch(&self, event: LedgerEvent) {
        self.queues
            .entry(ContextId::current())
            .or_default()
            .push(event);
    }

    fn flush(&self) {
        let Some((_, queue)) = self.queues.remove(&ContextId::current()) else {
            return;
        };

        let ordered = group_by_kind(queue);
        tracing::debug!(events = ordered.len(), "Flushing ledger events");

        let listeners = self.listeners.read().clone();
        for event in &ordered {
            for listener in &listeners {
                listener.handle(event);
            }
        }
    }

    fn forget(&self) {
        if let Some((_, queue)) = self.queues.remove(&ContextId::current()) {
            tracing::debug!(events = queue.len(), "Forgetting ledger events");
        }
    }
}

/// Stable grouping by kind in order of first appearance
fn group_by_kind(queue: Vec<LedgerEvent>) -> Vec<LedgerEvent> {
    let mut groups: Vec<(EventKind, Vec<LedgerEvent>)> = Vec::new();
    for event in queue {
        let kind = event.kind();
        match groups.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, group)) => group.push(event),
            None => groups.push((kind, vec![event])),
        }
    }
    groups.into_iter().flat_map(|(_, group)| group).collect()
}
