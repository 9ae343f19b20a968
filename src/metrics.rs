//! Per-chain rolling counters for the orchestrator.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one chain.
#[derive(Default)]
pub struct ChainMetrics {
    pub total_requests: AtomicU64,
    pub fulfilled_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub expired_requests: AtomicU64,
    /// Sum of end-to-end processing latencies in milliseconds.
    pub processing_latency_sum_ms: AtomicU64,
    /// Number of fulfillments contributing to the latency sum.
    pub fulfillment_count: AtomicU64,
}

impl ChainMetrics {
    /// Average processing latency in milliseconds, or 0 if none.
    pub fn avg_latency_ms(&self) -> u64 {
        let count = self.fulfillment_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.processing_latency_sum_ms.load(Ordering::Relaxed) / count
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "fulfilled_requests": self.fulfilled_requests.load(Ordering::Relaxed),
            "failed_requests": self.failed_requests.load(Ordering::Relaxed),
            "expired_requests": self.expired_requests.load(Ordering::Relaxed),
            "avg_processing_latency_ms": self.avg_latency_ms(),
        })
    }
}

/// Aggregated metrics keyed by chain id. The chain set is fixed at
/// startup, so lookups need no locking.
pub struct Metrics {
    chains: HashMap<u64, ChainMetrics>,
}

impl Metrics {
    pub fn new(chain_ids: impl IntoIterator<Item = u64>) -> Self {
        let chains = chain_ids
            .into_iter()
            .map(|id| (id, ChainMetrics::default()))
            .collect();
        Self { chains }
    }

    fn chain(&self, chain_id: u64) -> Option<&ChainMetrics> {
        self.chains.get(&chain_id)
    }

    /// Record a newly observed request.
    pub fn record_request(&self, chain_id: u64) {
        if let Some(c) = self.chain(chain_id) {
            c.total_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a confirmed fulfillment with its end-to-end latency.
    pub fn record_fulfillment(&self, chain_id: u64, latency_ms: u64) {
        if let Some(c) = self.chain(chain_id) {
            c.fulfilled_requests.fetch_add(1, Ordering::Relaxed);
            c.processing_latency_sum_ms
                .fetch_add(latency_ms, Ordering::Relaxed);
            c.fulfillment_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a terminally failed request.
    pub fn record_failure(&self, chain_id: u64) {
        if let Some(c) = self.chain(chain_id) {
            c.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an expired request.
    pub fn record_expiry(&self, chain_id: u64) {
        if let Some(c) = self.chain(chain_id) {
            c.expired_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Serialize all chains as a JSON object keyed by chain id.
    pub fn to_json(&self) -> serde_json::Value {
        let mut chains = serde_json::Map::new();
        for (id, metrics) in &self.chains {
            chains.insert(id.to_string(), metrics.to_json());
        }
        serde_json::Value::Object(chains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_chain() {
        let metrics = Metrics::new([1, 2]);
        metrics.record_request(1);
        metrics.record_request(1);
        metrics.record_fulfillment(1, 100);
        metrics.record_fulfillment(1, 300);
        metrics.record_failure(2);
        metrics.record_expiry(2);
        // Unknown chains are ignored, not panicked on.
        metrics.record_request(99);

        let json = metrics.to_json();
        assert_eq!(json["1"]["total_requests"], 2);
        assert_eq!(json["1"]["fulfilled_requests"], 2);
        assert_eq!(json["1"]["avg_processing_latency_ms"], 200);
        assert_eq!(json["2"]["failed_requests"], 1);
        assert_eq!(json["2"]["expired_requests"], 1);
    }
}
