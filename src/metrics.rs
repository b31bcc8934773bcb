//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replicated operations by kind and outcome
//! - Node calls by phase and outcome, with latency
//! - Phase transitions and consistency warnings
//! - Upload staging volume
//! - Circuit breaker rejections and ledger replays
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The library only emits through the `metrics` facade; installing a
//! recorder/exporter is up to the embedding binary.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a finished replicated operation.
pub fn record_operation(kind: &str, outcome: &str, duration: Duration) {
    counter!(
        "replicator_operations_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("replicator_operation_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a submission rejected before dispatch (programmer error, shutdown).
pub fn record_rejected_submission(reason: &str) {
    counter!("replicator_rejected_submissions_total", "reason" => reason.to_string()).increment(1);
}

/// Record one node call.
pub fn record_node_call(node_id: &str, phase: &str, outcome: &str, latency: Duration) {
    counter!(
        "replicator_node_calls_total",
        "node_id" => node_id.to_string(),
        "phase" => phase.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "replicator_node_call_duration_seconds",
        "node_id" => node_id.to_string(),
        "phase" => phase.to_string()
    )
    .record(latency.as_secs_f64());
}

/// Record a phase state machine transition.
pub fn record_phase_transition(phase: &str) {
    counter!("replicator_phase_transitions_total", "phase" => phase.to_string()).increment(1);
}

/// Record nodes skipped at resolution (not connected).
pub fn record_skipped_nodes(count: usize) {
    if count > 0 {
        counter!("replicator_skipped_nodes_total").increment(count as u64);
    }
}

/// Record nodes whose outcome is unknown after a deadline.
pub fn record_unknown_outcomes(count: usize) {
    if count > 0 {
        counter!("replicator_unknown_outcome_nodes_total").increment(count as u64);
    }
}

/// Record a node payload diverging from the representative.
pub fn record_consistency_warning(node_id: &str) {
    counter!("replicator_consistency_warnings_total", "node_id" => node_id.to_string()).increment(1);
}

/// Gauge for operations currently in flight.
pub fn set_in_flight_operations(count: usize) {
    gauge!("replicator_in_flight_operations").set(count as f64);
}

/// Record a staged upload.
pub fn record_upload_staged(bytes: u64, spilled: bool) {
    let storage = if spilled { "file" } else { "memory" };
    counter!("replicator_upload_staged_bytes_total", "storage" => storage).increment(bytes);
    histogram!("replicator_upload_size_bytes").record(bytes as f64);
}

/// Record a call short-circuited by an open node circuit.
pub fn record_circuit_rejection(node_id: &str) {
    counter!("replicator_circuit_rejections_total", "node_id" => node_id.to_string()).increment(1);
}

/// Record a phase answered from the idempotency ledger.
pub fn record_ledger_replay(phase: &str) {
    counter!("replicator_ledger_replays_total", "phase" => phase.to_string()).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Numeric for alerting
    let value = match state {
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replicator_engine_state").set(value);
}
