// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Dispatch routing (which path, which store)
//! - Replication enqueue outcomes
//! - Consumer outcomes, retries and abandonment
//! - Policy anomalies (unknown modes, unclassifiable calls)
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `dualwrite_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Dispatch
// =============================================================================

/// Record a dispatched call and the path it took (`single` or `dual`).
pub fn record_dispatch(kind: &str, mode: &str, path: &str) {
    counter!(
        "dualwrite_dispatch_total",
        "kind" => kind.to_string(),
        "mode" => mode.to_string(),
        "path" => path.to_string()
    )
    .increment(1);
}

/// Record the latency and outcome of a synchronous first write.
pub fn record_first_write(target: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("dualwrite_first_writes_total", "target" => target.to_string(), "status" => status)
        .increment(1);
    histogram!("dualwrite_first_write_duration_seconds", "target" => target.to_string())
        .record(duration.as_secs_f64());
}

/// Record a replication enqueue attempt.
///
/// `outcome` is one of `sent`, `failed`, `rejected` (circuit open), `no_transport`.
pub fn record_enqueue(outcome: &str) {
    counter!("dualwrite_enqueue_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a routing or classification anomaly that was resolved by a default.
pub fn record_policy_anomaly(kind: &str) {
    counter!("dualwrite_policy_anomalies_total", "kind" => kind.to_string()).increment(1);
}

// =============================================================================
// Consumer
// =============================================================================

/// Record the outcome of processing one delivery.
///
/// `outcome` is one of `applied`, `duplicate`, `retry_scheduled`, `abandoned`.
pub fn record_consume(outcome: &str) {
    counter!("dualwrite_consume_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record latency of a replicated invocation.
pub fn record_replay_latency(target: &str, duration: Duration) {
    histogram!("dualwrite_replay_duration_seconds", "target" => target.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retry being scheduled.
pub fn record_retry_scheduled(attempt: u32, delay: Duration) {
    counter!("dualwrite_retries_scheduled_total", "attempt" => attempt.to_string()).increment(1);
    histogram!("dualwrite_retry_delay_seconds").record(delay.as_secs_f64());
}

/// Record a message giving up after its retry budget.
pub fn record_abandoned(operation: &str) {
    counter!("dualwrite_abandoned_total", "operation" => operation.to_string()).increment(1);
}

/// Record a dead-letter persistence attempt.
pub fn record_dead_letter_persist(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("dualwrite_dead_letter_persists_total", "status" => status).increment(1);
}

/// Record an idempotency store error (the message falls back to the retry path).
pub fn record_idempotency_error(operation: &str) {
    counter!("dualwrite_idempotency_errors_total", "operation" => operation.to_string())
        .increment(1);
}

// =============================================================================
// Transport
// =============================================================================

/// Record messages received by a consumer worker.
pub fn record_received(transport: &str, count: usize) {
    counter!("dualwrite_received_total", "transport" => transport.to_string())
        .increment(count as u64);
}

/// Record a transport-level error by operation.
pub fn record_transport_error(transport: &str, operation: &str) {
    counter!(
        "dualwrite_transport_errors_total",
        "transport" => transport.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a Redis connection attempt outcome.
pub fn record_redis_connection(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("dualwrite_redis_connections_total", "status" => status).increment(1);
}

/// Record delayed messages promoted to the live stream.
pub fn record_delayed_promoted(count: usize) {
    counter!("dualwrite_delayed_promoted_total").increment(count as u64);
}

/// Record deliveries reclaimed from idle consumers.
pub fn record_reclaimed(count: usize) {
    counter!("dualwrite_reclaimed_total").increment(count as u64);
}

/// Record a corrupt wire entry that was dropped.
pub fn record_corrupt_entry(transport: &str) {
    counter!("dualwrite_corrupt_entries_total", "transport" => transport.to_string())
        .increment(1);
}

// =============================================================================
// Engine / Circuit Breaker
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("dualwrite_engine_state").set(value);
}

/// Gauge for the current write mode (0..=3 in migration order).
pub fn set_write_mode(mode: &str) {
    let value = match mode {
        "PRIMARY_ONLY" => 0.0,
        "PRIMARY_THEN_SECONDARY" => 1.0,
        "SECONDARY_THEN_PRIMARY" => 2.0,
        "SECONDARY_ONLY" => 3.0,
        _ => -1.0,
    };
    gauge!("dualwrite_write_mode").set(value);
}

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "dualwrite_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "dualwrite_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder every call is a no-op; these only prove
    // none of them panic on odd label values.
    #[test]
    fn test_record_functions_without_recorder() {
        record_dispatch("create", "PRIMARY_THEN_SECONDARY", "dual");
        record_first_write("primary", true, Duration::from_millis(3));
        record_enqueue("sent");
        record_policy_anomaly("unclassifiable");
        record_consume("applied");
        record_replay_latency("secondary", Duration::from_millis(1));
        record_retry_scheduled(2, Duration::from_secs(5));
        record_abandoned("users.insertUser");
        record_dead_letter_persist(false);
        record_idempotency_error("exists");
        record_received("memory", 3);
        record_transport_error("redis_stream", "XADD");
        record_redis_connection(true);
        record_delayed_promoted(0);
        record_reclaimed(0);
        record_corrupt_entry("redis_stream");
        record_circuit_call("transport_send", "success");
        record_circuit_rejection("transport_send");
    }

    #[test]
    fn test_state_gauges_accept_unknown_values() {
        set_engine_state("Running");
        set_engine_state("Bogus");
        set_write_mode("SECONDARY_ONLY");
        set_write_mode("");
    }
}
