//! Sync progress and performance counters.

use crate::{NetworkQuality, Timestamp};
use serde::{Deserialize, Serialize};

/// Fallback per-item time estimate before any response time is known.
pub const DEFAULT_ITEM_ESTIMATE_MS: u64 = 2_000;

/// Live view of a sync pass. Recomputed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub in_progress: bool,
    pub current_operation: String,
    pub estimated_time_remaining_ms: u64,
    pub network_quality: NetworkQuality,
}

impl SyncProgress {
    /// Progress of an engine that is not syncing.
    pub fn idle(total_items: usize, network_quality: NetworkQuality) -> Self {
        Self {
            total_items,
            completed_items: 0,
            failed_items: 0,
            in_progress: false,
            current_operation: "Idle".to_string(),
            estimated_time_remaining_ms: 0,
            network_quality,
        }
    }

    /// Progress at the start of a pass over `total_items`.
    pub fn started(total_items: usize, network_quality: NetworkQuality) -> Self {
        Self {
            in_progress: true,
            current_operation: String::new(),
            ..Self::idle(total_items, network_quality)
        }
    }

    /// Items neither completed nor failed yet.
    pub fn remaining(&self) -> usize {
        self.total_items
            .saturating_sub(self.completed_items + self.failed_items)
    }

    /// Update the estimate from the average response time. No estimate is
    /// made before the first completion.
    pub fn update_estimate(&mut self, average_response_ms: Option<u64>) {
        self.estimated_time_remaining_ms = if self.completed_items == 0 {
            0
        } else {
            let per_item = average_response_ms.unwrap_or(DEFAULT_ITEM_ESTIMATE_MS);
            per_item.saturating_mul(self.remaining() as u64)
        };
    }

    /// Mark the pass finished.
    pub fn finish(&mut self) {
        self.in_progress = false;
        self.current_operation = "Idle".to_string();
        self.estimated_time_remaining_ms = 0;
    }

    /// Share of the pass that committed; 1.0 for an empty pass.
    pub fn success_rate(&self) -> f64 {
        if self.total_items == 0 {
            1.0
        } else {
            self.completed_items as f64 / self.total_items as f64
        }
    }
}

/// Aggregate engine performance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub cache_hit_rate: f64,
    pub average_response_time_ms: f64,
    pub offline_queue_size: usize,
    pub sync_success_rate: f64,
    /// Bytes served from cache instead of the network
    pub bandwidth_savings: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// A persisted metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub timestamp: Timestamp,
    pub metrics: PerformanceMetrics,
}

/// Running counters behind [`PerformanceMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsAccumulator {
    cache_hits: u64,
    cache_misses: u64,
    bandwidth_savings: u64,
    response_time_total_ms: u64,
    responses: u64,
    sync_success_rate: f64,
}

impl Default for MetricsAccumulator {
    fn default() -> Self {
        Self {
            cache_hits: 0,
            cache_misses: 0,
            bandwidth_savings: 0,
            response_time_total_ms: 0,
            responses: 0,
            sync_success_rate: 1.0,
        }
    }
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a cache hit that saved `bytes` of transfer.
    pub fn record_hit(&mut self, bytes: u64) {
        self.cache_hits += 1;
        self.bandwidth_savings = self.bandwidth_savings.saturating_add(bytes);
    }

    pub fn record_miss(&mut self) {
        self.cache_misses += 1;
    }

    /// Count one remote round trip.
    pub fn record_response(&mut self, elapsed_ms: u64) {
        self.response_time_total_ms = self.response_time_total_ms.saturating_add(elapsed_ms);
        self.responses += 1;
    }

    /// Record the result of a finished pass.
    pub fn record_pass(&mut self, progress: &SyncProgress) {
        self.sync_success_rate = progress.success_rate();
    }

    pub fn average_response_ms(&self) -> Option<u64> {
        (self.responses > 0).then(|| self.response_time_total_ms / self.responses)
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    pub fn snapshot(&self, offline_queue_size: usize) -> PerformanceMetrics {
        let average = if self.responses == 0 {
            0.0
        } else {
            self.response_time_total_ms as f64 / self.responses as f64
        };
        PerformanceMetrics {
            cache_hit_rate: self.cache_hit_rate(),
            average_response_time_ms: average,
            offline_queue_size,
            sync_success_rate: self.sync_success_rate,
            bandwidth_savings: self.bandwidth_savings,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
        }
    }
}
