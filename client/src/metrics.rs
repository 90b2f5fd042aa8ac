//! Metrics instrumentation for the sync runtime.
//!
//! Uses the `metrics` facade; the host installs the exporter.
//!
//! # Metric Naming Convention
//! - `encore_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use encore_engine::NetworkQuality;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an item leaving the processor with `outcome`
/// (`committed`, `retrying`, `failed`, `parked`).
pub fn record_item(operation: &str, outcome: &'static str) {
    counter!(
        "encore_items_processed_total",
        "operation" => operation.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_enqueue(operation_type: &'static str) {
    counter!("encore_items_enqueued_total", "type" => operation_type).increment(1);
}

/// Record one remote attempt.
pub fn record_remote_latency(operation: &str, duration: Duration) {
    histogram!(
        "encore_remote_request_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_conflict(strategy: &'static str) {
    counter!("encore_conflicts_total", "strategy" => strategy).increment(1);
}

pub fn record_pass(duration: Duration, aborted: bool) {
    let status = if aborted { "aborted" } else { "completed" };
    counter!("encore_sync_passes_total", "status" => status).increment(1);
    histogram!("encore_sync_pass_seconds").record(duration.as_secs_f64());
}

pub fn record_coalesced_trigger() {
    counter!("encore_sync_triggers_coalesced_total").increment(1);
}

pub fn record_cache_lookup(strategy: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(
        "encore_cache_lookups_total",
        "strategy" => strategy.to_string(),
        "result" => result
    )
    .increment(1);
}

pub fn record_bandwidth_saved(bytes: usize) {
    counter!("encore_cache_bytes_saved_total").increment(bytes as u64);
}

pub fn set_queue_depth(depth: usize) {
    gauge!("encore_queue_depth").set(depth as f64);
}

pub fn set_parked(count: usize) {
    gauge!("encore_parked_items").set(count as f64);
}

/// Quality as a number: 0 offline, 1 poor, 2 good, 3 excellent.
pub fn set_network_quality(quality: NetworkQuality) {
    let level = match quality {
        NetworkQuality::Offline => 0.0,
        NetworkQuality::Poor => 1.0,
        NetworkQuality::Good => 2.0,
        NetworkQuality::Excellent => 3.0,
    };
    gauge!("encore_network_quality").set(level);
}

pub fn record_persistence_error(operation: &'static str) {
    counter!("encore_persistence_errors_total", "operation" => operation).increment(1);
}
