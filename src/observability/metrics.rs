// src/observability/metrics.rs
//! Pool metrics
//!
//! Thin wrappers over the `metrics` facade. Without an installed recorder
//! these are no-ops.

use ::metrics::{counter, describe_counter, describe_gauge, gauge};

pub const SPAWNS_TOTAL: &str = "tenant_pool_spawns_total";
pub const SPAWN_FAILURES_TOTAL: &str = "tenant_pool_spawn_failures_total";
pub const EVICTIONS_TOTAL: &str = "tenant_pool_evictions_total";
pub const CRASHES_TOTAL: &str = "tenant_pool_crashes_total";
pub const QUERIES_TOTAL: &str = "tenant_pool_queries_total";
pub const LIVE_HANDLES: &str = "tenant_pool_live_handles";

/// Register help text with the installed recorder
pub fn describe() {
    describe_counter!(SPAWNS_TOTAL, "Workers that completed the ready handshake");
    describe_counter!(SPAWN_FAILURES_TOTAL, "Worker spawns that failed or timed out");
    describe_counter!(EVICTIONS_TOTAL, "Workers retired by the pool, by reason");
    describe_counter!(CRASHES_TOTAL, "Unexpected worker terminations, by cause");
    describe_counter!(QUERIES_TOTAL, "Finished queries, by outcome");
    describe_gauge!(LIVE_HANDLES, "Handles counting against capacity");
}

pub fn record_spawn() {
    counter!(SPAWNS_TOTAL).increment(1);
}

pub fn record_spawn_failure() {
    counter!(SPAWN_FAILURES_TOTAL).increment(1);
}

/// `reason` is one of `capacity`, `idle` or `drain`
pub fn record_eviction(reason: &str) {
    counter!(EVICTIONS_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_crash(reason: &str) {
    counter!(CRASHES_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_query(outcome: &str) {
    counter!(QUERIES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn set_live_handles(count: usize) {
    gauge!(LIVE_HANDLES).set(count as f64);
}
