//! Metrics collection for observability
//!
//! Prometheus collectors on a per-ledger registry. Nothing is registered
//! globally, so several ledgers can live in one process.
//!
//! # Metrics
//!
//! - `ledger_transactions_total{kind}` - Persisted transactions
//! - `ledger_transfers_total` - Persisted transfers
//! - `ledger_commits_total` - Committed host transactions
//! - `ledger_rollbacks_total` - Rolled back host transactions
//! - `ledger_lock_wait_seconds` - Histogram of lock acquisition latencies
//! - `ledger_lock_timeouts_total` - Lock acquisitions that timed out
//! - `ledger_bookkeeper_hits_total` - Balance cache hits
//! - `ledger_bookkeeper_misses_total` - Balance cache misses (store fallbacks)
//! - `ledger_checksum_failures_total` - Failed checksum verifications

use crate::types::TransactionKind;
use crate::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Persisted transactions by kind
    pub transactions_total: IntCounterVec,

    /// Persisted transfers
    pub transfers_total: IntCounter,

    /// Committed host transactions
    pub commits_total: IntCounter,

    /// Rolled back host transactions
    pub rollbacks_total: IntCounter,

    /// Lock acquisition latency
    pub lock_wait: Histogram,

    /// Lock acquisitions that timed out
    pub lock_timeouts_total: IntCounter,

    /// Balance cache hits
    pub cache_hits_total: IntCounter,

    /// Balance cache misses
    pub cache_misses_total: IntCounter,

    /// Failed checksum verifications
    pub checksum_failures_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("commits_total", &self.commits_total.get())
            .field("rollbacks_total", &self.rollbacks_total.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let transactions_total = IntCounterVec::new(
            Opts::new("ledger_transactions_total", "Total number of persisted transactions"),
            &["kind"],
        )?;
        registry.register(Box::new(transactions_total.clone()))?;

        let transfers_total =
            IntCounter::new("ledger_transfers_total", "Total number of persisted transfers")?;
        registry.register(Box::new(transfers_total.clone()))?;

        let commits_total =
            IntCounter::new("ledger_commits_total", "Total number of committed transactions")?;
        registry.register(Box::new(commits_total.clone()))?;

        let rollbacks_total = IntCounter::new(
            "ledger_rollbacks_total",
            "Total number of rolled back transactions",
        )?;
        registry.register(Box::new(rollbacks_total.clone()))?;

        let lock_wait = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_lock_wait_seconds",
                "Histogram of lock acquisition latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(lock_wait.clone()))?;

        let lock_timeouts_total = IntCounter::new(
            "ledger_lock_timeouts_total",
            "Total number of lock acquisitions that timed out",
        )?;
        registry.register(Box::new(lock_timeouts_total.clone()))?;

        let cache_hits_total =
            IntCounter::new("ledger_bookkeeper_hits_total", "Total number of balance cache hits")?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let cache_misses_total = IntCounter::new(
            "ledger_bookkeeper_misses_total",
            "Total number of balance cache misses",
        )?;
        registry.register(Box::new(cache_misses_total.clone()))?;

        let checksum_failures_total = IntCounter::new(
            "ledger_checksum_failures_total",
            "Total number of failed checksum verifications",
        )?;
        registry.register(Box::new(checksum_failures_total.clone()))?;

        Ok(Self {
            transactions_total,
            transfers_total,
            commits_total,
            rollbacks_total,
            lock_wait,
            lock_timeouts_total,
            cache_hits_total,
            cache_misses_total,
            checksum_failures_total,
            registry,
        })
    }

    /// Record persisted transactions
    pub fn record_transactions(&self, kind: TransactionKind, count: u64) {
        self.transactions_total
            .with_label_values(&[kind.as_str()])
            .inc_by(count);
    }

    /// Record a persisted transfer
    pub fn record_transfer(&self) {
        self.transfers_total.inc();
    }

    /// Record a commit
    pub fn record_commit(&self) {
        self.commits_total.inc();
    }

    /// Record a rollback
    pub fn record_rollback(&self) {
        self.rollbacks_total.inc();
    }

    /// Record lock acquisition latency
    pub fn record_lock_wait(&self, duration_seconds: f64) {
        self.lock_wait.observe(duration_seconds);
    }

    /// Record a lock timeout
    pub fn record_lock_timeout(&self) {
        self.lock_timeouts_total.inc();
    }

    /// Record balance cache hits
    pub fn record_cache_hits(&self, count: u64) {
        self.cache_hits_total.inc_by(count);
    }

    /// Record balance cache misses
    pub fn record_cache_misses(&self, count: u64) {
        self.cache_misses_total.inc_by(count);
    }

    /// Record a checksum failure
    pub fn record_checksum_failure(&self) {
        self.checksum_failures_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
