// src/core/metrics.rs

//! Defines and registers Prometheus metrics for daemon monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_gauge_vec,
};

lazy_static! {
    /// Discovery events by outcome (accepted, denied, filtered, refused).
    pub static ref DISCOVERY_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "spoolbridge_discovery_events_total",
        "Discovery events processed, labelled by outcome.",
        &["outcome"]
    )
    .unwrap();

    /// Registry entries by lifecycle status.
    pub static ref REGISTRY_ENTRIES: GaugeVec = register_gauge_vec!(
        "spoolbridge_registry_entries",
        "Registry entries, labelled by status.",
        &["status"]
    )
    .unwrap();

    /// Local queues created or updated by the daemon.
    pub static ref QUEUES_CREATED_TOTAL: Counter = register_counter!(
        "spoolbridge_queues_created_total",
        "Local queues created or modified."
    )
    .unwrap();

    /// Local queues deleted by the daemon.
    pub static ref QUEUES_DELETED_TOTAL: Counter = register_counter!(
        "spoolbridge_queues_deleted_total",
        "Local queues deleted."
    )
    .unwrap();

    /// Job dispatches by outcome (dispatched, all_busy, no_destination).
    pub static ref DISPATCHES_TOTAL: CounterVec = register_counter_vec!(
        "spoolbridge_dispatches_total",
        "Job dispatch decisions, labelled by outcome.",
        &["outcome"]
    )
    .unwrap();

    /// Spooler RPCs that missed their deadline.
    pub static ref SPOOLER_TIMEOUTS_TOTAL: Counter = register_counter!(
        "spoolbridge_spooler_timeouts_total",
        "Local spooler RPC timeouts."
    )
    .unwrap();

    /// Jobs currently active on daemon-controlled queues.
    pub static ref ACTIVE_JOBS: Gauge = register_gauge!(
        "spoolbridge_active_jobs",
        "Jobs currently active on daemon-controlled queues."
    )
    .unwrap();
}

/// Gathers all registered metrics into the Prometheus text exposition
/// format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    encoder.encode_to_string(&families).unwrap_or_default()
}
