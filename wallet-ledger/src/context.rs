//! Execution-context identity
//!
//! The ledger is driven synchronously from host threads. Each thread is one
//! execution context: it owns its locks, its pending ledger, its open host
//! transaction and its queued events. Components key per-context state by
//! [`ContextId`].

use std::fmt;
use uuid::Uuid;

thread_local! {
    static CONTEXT: Uuid = Uuid::new_v4();
}

/// Identity of the calling execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(Uuid);

impl ContextId {
    /// Context of the calling thread
    pub fn current() -> Self {
        CONTEXT.with(|id| Self(*id))
    }

    /// Underlying token
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
