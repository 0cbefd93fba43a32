//! Router activity counters.
//!
//! Plain atomics; exporting them to a metrics sink is the embedder's
//! concern.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters and gauges describing router activity.
#[derive(Debug, Default)]
pub struct DistSenderMetrics {
    /// Batches processed.
    pub batches: AtomicU64,
    /// Partial (per-range) batches processed.
    pub partial_batches: AtomicU64,
    /// RPCs sent.
    pub rpc_sent: AtomicU64,
    /// RPCs sent to a replica on the local node.
    pub rpc_sent_local: AtomicU64,
    /// RPCs re-sent to another replica after a per-replica error.
    pub next_replica_errors: AtomicU64,
    /// NotLeaseHolder errors encountered.
    pub not_lease_holder_errors: AtomicU64,
    /// Requests currently stuck in the router past the slow threshold.
    pub slow_requests: AtomicI64,
    /// Partial batches dispatched in parallel over the router's lifetime.
    pub async_sends: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub partial_batches: u64,
    pub rpc_sent: u64,
    pub rpc_sent_local: u64,
    pub next_replica_errors: u64,
    pub not_lease_holder_errors: u64,
    pub slow_requests: i64,
    pub async_sends: u64,
}

impl DistSenderMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            partial_batches: self.partial_batches.load(Ordering::Relaxed),
            rpc_sent: self.rpc_sent.load(Ordering::Relaxed),
            rpc_sent_local: self.rpc_sent_local.load(Ordering::Relaxed),
            next_replica_errors: self.next_replica_errors.load(Ordering::Relaxed),
            not_lease_holder_errors: self.not_lease_holder_errors.load(Ordering::Relaxed),
            slow_requests: self.slow_requests.load(Ordering::Relaxed),
            async_sends: self.async_sends.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard pairing the slow-request gauge increment with its decrement.
pub(crate) struct SlowRequestGuard<'a> {
    metrics: &'a DistSenderMetrics,
}

impl<'a> SlowRequestGuard<'a> {
    pub(crate) fn new(metrics: &'a DistSenderMetrics) -> Self {
        metrics.slow_requests.fetch_add(1, Ordering::Relaxed);
        Self { metrics }
    }
}

impl Drop for SlowRequestGuard<'_> {
    fn drop(&mut self) {
        self.metrics.slow_requests.fetch_sub(1, Ordering::Relaxed);
    }
}
