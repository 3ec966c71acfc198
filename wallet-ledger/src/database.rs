//! Host transaction wrapper
//!
//! One physical record-store transaction per execution context. Nested
//! calls join the outer transaction; only the outermost one begins,
//! commits or rolls back, and only it notifies [`TransactionListener`]s.
//!
//! # Outcomes
//!
//! - `Ok(Outcome::Commit(v))`: commit, return `v`
//! - `Ok(Outcome::Rollback(v))`: roll back silently, return `v`
//! - `Err(e)`: roll back; domain errors pass through, everything else
//!   becomes `TransactionFailed`
//!
//! There are no savepoints. A rollback or error in a nested scope marks the
//! whole transaction rollback-only, and the outermost scope then fails with
//! `TransactionFailed` even if the nested error was handled.

use crate::context::ContextId;
use crate::metrics::Metrics;
use crate::store::RecordStore;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Hooks around the outermost transaction
pub trait TransactionListener: Send + Sync {
    /// After the physical transaction began
    fn on_begin(&self) -> Result<()> {
        Ok(())
    }

    /// Before the physical commit; an error rolls back
    fn on_pre_commit(&self) -> Result<()> {
        Ok(())
    }

    /// After the physical commit
    fn on_post_commit(&self) {}

    /// After a physical rollback
    fn on_rollback(&self) {}
}

/// Result of a transaction closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Commit and return the value
    Commit(T),
    /// Roll back and return the value
    Rollback(T),
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    level: u32,
    rollback_only: bool,
}

/// Transaction wrapper over a [`RecordStore`]
pub struct Database {
    store: Arc<dyn RecordStore>,
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
    frames: DashMap<ContextId, Frame>,
    metrics: Metrics,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("listeners", &self.listeners.read().len())
            .field("open", &self.frames.len())
            .finish()
    }
}

impl Database {
    /// Create over a record store
    pub fn new(store: Arc<dyn RecordStore>, metrics: Metrics) -> Self {
        Self {
            store,
            listeners: RwLock::new(Vec::new()),
            frames: DashMap::new(),
            metrics,
        }
    }

    /// Register lifecycle hooks; called in registration order
    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.write().push(listener);
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Nesting depth of the calling context (0 outside a transaction)
    pub fn level(&self) -> u32 {
        self.frames
            .get(&ContextId::current())
            .map_or(0, |frame| frame.level)
    }

    /// Whether the calling context is inside a transaction
    pub fn in_transaction(&self) -> bool {
        self.level() > 0
    }

    /// Run `f` in a transaction, committing on `Ok`
    pub fn transaction<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.transaction_with(|| f().map(Outcome::Commit))
    }

    /// Run `f` in a transaction; `f` chooses commit or rollback
    pub fn transaction_with<R>(&self, f: impl FnOnce() -> Result<Outcome<R>>) -> Result<R> {
        let context = ContextId::current();

        let nested = match self.frames.get_mut(&context) {
            Some(mut frame) => {
                frame.level += 1;
                true
            }
            None => false,
        };

        if nested {
            return self.run_nested(context, f);
        }

        self.run_outer(context, f)
    }

    fn run_nested<R>(
        &self,
        context: ContextId,
        f: impl FnOnce() -> Result<Outcome<R>>,
    ) -> Result<R> {
        let mut guard = NestedGuard {
            db: self,
            context,
            poison: true,
        };

        let result = f();
        guard.poison = !matches!(result, Ok(Outcome::Commit(_)));
        drop(guard);

        match result {
            Ok(Outcome::Commit(value)) | Ok(Outcome::Rollback(value)) => Ok(value),
            Err(err) => Err(err),
        }
    }

    fn run_outer<R>(
        &self,
        context: ContextId,
        f: impl FnOnce() -> Result<Outcome<R>>,
    ) -> Result<R> {
        self.store
            .begin()
            .map_err(Error::into_transaction_failure)?;
        self.frames.insert(
            context,
            Frame {
                level: 1,
                rollback_only: false,
            },
        );

        let mut guard = OuterGuard {
            db: self,
            context,
            armed: true,
        };

        let listeners = self.listeners.read().clone();
        let result = listeners
            .iter()
            .try_for_each(|listener| listener.on_begin())
            .and_then(|()| f());

        let rollback_only = self
            .frames
            .get(&context)
            .map_or(false, |frame| frame.rollback_only);

        guard.armed = false;

        match result {
            Ok(Outcome::Commit(value)) if !rollback_only => {
                self.commit(context, &listeners)?;
                Ok(value)
            }
            Ok(Outcome::Commit(_)) => {
                self.abort(context, &listeners);
                Err(Error::TransactionFailed(
                    "transaction was marked rollback-only by a nested scope".to_string(),
                ))
            }
            Ok(Outcome::Rollback(value)) => {
                self.abort(context, &listeners);
                Ok(value)
            }
            Err(err) => {
                self.abort(context, &listeners);
                Err(err.into_transaction_failure())
            }
        }
    }

    fn commit(&self, context: ContextId, listeners: &[Arc<dyn TransactionListener>]) -> Result<()> {
        let prepared = listeners
            .iter()
            .try_for_each(|listener| listener.on_pre_commit())
            .and_then(|()| self.store.commit());

        if let Err(err) = prepared {
            self.abort(context, listeners);
            return Err(err.into_transaction_failure());
        }

        self.frames.remove(&context);
        self.metrics.record_commit();
        tracing::debug!(%context, "Transaction committed");

        for listener in listeners {
            listener.on_post_commit();
        }
        Ok(())
    }

    fn abort(&self, context: ContextId, listeners: &[Arc<dyn TransactionListener>]) {
        self.frames.remove(&context);
        if let Err(err) = self.store.rollback() {
            tracing::error!(%context, error = %err, "Record store rollback failed");
        }
        self.metrics.record_rollback();
        tracing::warn!(%context, "Transaction rolled back");

        for listener in listeners {
            listener.on_rollback();
        }
    }
}

/// Rolls the outermost transaction back if its closure unwinds
struct OuterGuard<'a> {
    db: &'a Database,
    context: ContextId,
    armed: bool,
}

impl Drop for OuterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let listeners = self.db.listeners.read().clone();
            self.db.abort(self.context, &listeners);
        }
    }
}

/// Leaves a nested scope, marking the transaction rollback-only unless the
/// scope completed with a commit
struct NestedGuard<'a> {
    db: &'a Database,
    context: ContextId,
    poison: bool,
}

impl Drop for NestedGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut frame) = self.db.frames.get_mut(&self.context) {
            frame.level = frame.level.saturating_sub(1);
            if self.poison {
                frame.rollback_only = true;
            }
        }
    }
}
