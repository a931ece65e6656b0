//! Metrics collection for observability
//!
//! Prometheus metrics, registered on a per-instance registry so several
//! ledgers (tests, embedded hosts) can live in one process.
//!
//! # Metrics
//!
//! - `seller_ledger_entries_total{kind}` - Entries committed, by entry kind
//! - `seller_ledger_commits_total` - Atomic units committed
//! - `seller_ledger_replays_total` - Idempotent replays served
//! - `seller_ledger_contention_retries_total` - Optimistic commit retries
//! - `seller_ledger_contention_failures_total` - Operations that exhausted retries
//! - `seller_ledger_withdrawal_transitions_total{status}` - Withdrawal status changes
//! - `seller_ledger_commit_duration_seconds` - Latched verify-and-write latency

use crate::types::{EntryKind, WithdrawalStatus};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Entries committed, by kind
    pub entries_total: IntCounterVec,

    /// Atomic units committed
    pub commits_total: IntCounter,

    /// Idempotent replays
    pub replays_total: IntCounter,

    /// Commit attempts retried after a conflict
    pub contention_retries: IntCounter,

    /// Operations failed with `Contention`
    pub contention_failures: IntCounter,

    /// Withdrawal transitions, by target status
    pub withdrawal_transitions: IntCounterVec,

    /// Commit duration histogram
    pub commit_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("commits_total", &self.commits_total.get())
            .field("replays_total", &self.replays_total.get())
            .field("contention_retries", &self.contention_retries.get())
            .finish()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total = IntCounterVec::new(
            Opts::new("seller_ledger_entries_total", "Ledger entries committed"),
            &["kind"],
        )?;
        registry.register(Box::new(entries_total.clone()))?;

        let commits_total = IntCounter::new(
            "seller_ledger_commits_total",
            "Atomic units committed",
        )?;
        registry.register(Box::new(commits_total.clone()))?;

        let replays_total = IntCounter::new(
            "seller_ledger_replays_total",
            "Idempotent replays served",
        )?;
        registry.register(Box::new(replays_total.clone()))?;

        let contention_retries = IntCounter::new(
            "seller_ledger_contention_retries_total",
            "Optimistic commit retries",
        )?;
        registry.register(Box::new(contention_retries.clone()))?;

        let contention_failures = IntCounter::new(
            "seller_ledger_contention_failures_total",
            "Operations that exhausted optimistic retries",
        )?;
        registry.register(Box::new(contention_failures.clone()))?;

        let withdrawal_transitions = IntCounterVec::new(
            Opts::new(
                "seller_ledger_withdrawal_transitions_total",
                "Withdrawal status transitions",
            ),
            &["status"],
        )?;
        registry.register(Box::new(withdrawal_transitions.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "seller_ledger_commit_duration_seconds",
                "Latched verify-and-write latency",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            entries_total,
            commits_total,
            replays_total,
            contention_retries,
            contention_failures,
            withdrawal_transitions,
            commit_duration,
            registry,
        })
    }

    /// Record one committed entry
    pub fn record_entry(&self, kind: EntryKind) {
        self.entries_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Record a committed unit and its latched duration
    pub fn record_commit(&self, duration_seconds: f64) {
        self.commits_total.inc();
        self.commit_duration.observe(duration_seconds);
    }

    /// Record an idempotent replay
    pub fn record_replay(&self) {
        self.replays_total.inc();
    }

    /// Record a retry after a conflict
    pub fn record_contention_retry(&self) {
        self.contention_retries.inc();
    }

    /// Record an operation that gave up
    pub fn record_contention_failure(&self) {
        self.contention_failures.inc();
    }

    /// Record a withdrawal entering `status`
    pub fn record_withdrawal_transition(&self, status: WithdrawalStatus) {
        self.withdrawal_transitions
            .with_label_values(&[status.as_str()])
            .inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
