//! Delivery metrics.
//!
//! Atomic counters and a latency histogram, bundled into a sink that is
//! injected into the orchestrator as an `Arc`. Nothing here is global
//! mutable state; tests read the same counters the embedding app exports.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram for delivery-latency distributions, in milliseconds.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<(u64, AtomicU64)>, // (upper_bound_ms, count)
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Bounds sized for provider delivery confirmation: sub-second up to the
    /// half-hour delivery timeout.
    pub fn new() -> Self {
        Self::with_buckets(&[500, 1_000, 2_500, 5_000, 15_000, 60_000, 300_000, 1_800_000])
    }

    /// Create a histogram with custom bucket upper bounds (milliseconds).
    pub fn with_buckets(bounds: &[u64]) -> Self {
        let buckets = bounds.iter().map(|&b| (b, AtomicU64::new(0))).collect();
        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value (milliseconds).
    pub fn observe(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self
                .buckets
                .iter()
                .map(|(bound, count)| (*bound, count.load(Ordering::Relaxed)))
                .collect(),
            sum: self.sum(),
            count: self.count(),
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics sink for the delivery engine.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    /// Sends accepted by the transport provider.
    pub sent_total: Counter,
    /// Records that reached `Delivered`.
    pub delivered_total: Counter,
    /// Records that reached `FailedPermanent` (retries exhausted or a
    /// permanent failure on first contact).
    pub failed_total: Counter,
    /// Retry attempts that actually re-ran the send path.
    pub retry_total: Counter,
    /// New opt-out registry entries.
    pub optout_total: Counter,
    /// Provider confirmation latency (delivered minus sent), milliseconds.
    pub delivery_latency_ms: Histogram,
}

impl DeliveryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy for health endpoints and dashboards.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent_total: self.sent_total.get(),
            delivered_total: self.delivered_total.get(),
            failed_total: self.failed_total.get(),
            retry_total: self.retry_total.get(),
            optout_total: self.optout_total.get(),
            delivery_latency_ms: self.delivery_latency_ms.snapshot(),
        }
    }
}

/// Serializable counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub sent_total: u64,
    pub delivered_total: u64,
    pub failed_total: u64,
    pub retry_total: u64,
    pub optout_total: u64,
    pub delivery_latency_ms: HistogramSnapshot,
}

/// Serializable histogram snapshot: cumulative (bound, count) pairs.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<(u64, u64)>,
    pub sum: u64,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let c = Counter::new();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc();
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn test_histogram_observe() {
        let h = Histogram::with_buckets(&[10, 100, 1000]);
        h.observe(5);
        h.observe(50);
        h.observe(5000);
        assert_eq!(h.count(), 3);
        assert_eq!(h.sum(), 5055);
        let snap = h.snapshot();
        // Buckets are cumulative.
        assert_eq!(snap.buckets, vec![(10, 1), (100, 2), (1000, 2)]);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = DeliveryMetrics::new();
        m.sent_total.inc();
        m.delivery_latency_ms.observe(1200);
        let snap = m.snapshot();
        assert_eq!(snap.sent_total, 1);
        assert_eq!(snap.delivery_latency_ms.count, 1);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["sent_total"], 1);
    }
}
