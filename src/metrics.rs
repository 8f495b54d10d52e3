//! Process-wide operation metrics (§9 design note: "Metrics are a
//! process-wide singleton collector keyed by operation name... making it
//! injectable is a soft improvement over the source").
//!
//! Grounded in the teacher crate's `types/usage_metrics.rs` (a plain counter
//! struct accumulated per crew run), generalized here to a named-operation
//! collector since the retry/backoff helper (§4.8.3, `retry::retry_with_backoff`)
//! needs per-operation counters rather than one crew-scoped struct, and
//! exposed as an injectable `Arc<MetricsCollector>` with a process-default
//! singleton for ergonomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Atomic counters tracked per operation name.
#[derive(Debug, Default)]
pub struct OperationCounters {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub retries: AtomicU64,
    pub success_after_retry: AtomicU64,
}

/// A point-in-time read of one operation's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub success_after_retry: u64,
}

/// Collects attempt/success/failure/retry counts keyed by operation name
/// (e.g. `"tool.sum"`, `"model.invoke"`). Safe to share across threads; one
/// instance normally backs an entire process, but nothing requires that —
/// tests inject their own instance to assert on isolated counts.
#[derive(Default)]
pub struct MetricsCollector {
    operations: DashMap<String, OperationCounters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self, operation: &str) {
        self.operations
            .entry(operation.to_string())
            .or_default()
            .attempts
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful call. `retry_count` is the number of attempts
    /// that failed before this one succeeded; `0` means it succeeded on the
    /// first try.
    pub fn record_success(&self, operation: &str, retry_count: u32) {
        let entry = self.operations.entry(operation.to_string()).or_default();
        entry.successes.fetch_add(1, Ordering::Relaxed);
        if retry_count > 0 {
            entry.retries.fetch_add(retry_count as u64, Ordering::Relaxed);
            entry.success_after_retry.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a call that failed after exhausting its retry budget.
    /// `retry_count` is the number of retries attempted before giving up.
    pub fn record_failure(&self, operation: &str, retry_count: u32) {
        let entry = self.operations.entry(operation.to_string()).or_default();
        entry.failures.fetch_add(1, Ordering::Relaxed);
        entry.retries.fetch_add(retry_count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, operation: &str) -> OperationSnapshot {
        match self.operations.get(operation) {
            Some(c) => OperationSnapshot {
                attempts: c.attempts.load(Ordering::Relaxed),
                successes: c.successes.load(Ordering::Relaxed),
                failures: c.failures.load(Ordering::Relaxed),
                retries: c.retries.load(Ordering::Relaxed),
                success_after_retry: c.success_after_retry.load(Ordering::Relaxed),
            },
            None => OperationSnapshot::default(),
        }
    }
}

static GLOBAL: Lazy<Arc<MetricsCollector>> = Lazy::new(|| Arc::new(MetricsCollector::new()));

/// The process-default metrics collector. Callers that want isolated
/// counters (tests, multi-tenant embedding) should construct their own
/// `MetricsCollector` and inject it instead.
pub fn global() -> Arc<MetricsCollector> {
    Arc::clone(&GLOBAL)
}
