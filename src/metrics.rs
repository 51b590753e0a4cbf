// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Records received and delivered per shard
//! - Flush sizes, durations and write-call counts
//! - Partial-rejection and transport retry rounds
//! - Checkpoint outcomes
//! - Worker and engine state
//! - Input stream fetches
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate only emits through the `metrics` facade; installing a recorder
//! (e.g. a Prometheus exporter) is left to the embedding process.
//!
//! # Usage
//!
//! ```rust,no_run
//! use stream_replicator::metrics;
//! use std::time::Duration;
//!
//! // In the worker after a batch was delivered
//! metrics::record_flush("shard-0001", 500, 1_048_576, 2, Duration::from_millis(80));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Worker Metrics
// =============================================================================

/// Record records handed to a worker by the shard loop.
pub fn record_records_received(shard_id: &str, count: usize) {
    counter!("replicator_records_received_total", "shard_id" => shard_id.to_string())
        .increment(count as u64);
}

/// Record a fully delivered flush.
pub fn record_flush(shard_id: &str, records: usize, bytes: usize, write_calls: u32, duration: Duration) {
    let shard = shard_id.to_string();

    counter!("replicator_flushes_total", "shard_id" => shard.clone()).increment(1);
    counter!("replicator_records_delivered_total", "shard_id" => shard.clone())
        .increment(records as u64);
    counter!("replicator_bytes_delivered_total", "shard_id" => shard.clone())
        .increment(bytes as u64);
    histogram!("replicator_flush_size", "shard_id" => shard.clone()).record(records as f64);
    histogram!("replicator_flush_write_calls", "shard_id" => shard.clone()).record(write_calls as f64);
    histogram!("replicator_flush_duration_seconds", "shard_id" => shard).record(duration.as_secs_f64());
}

/// Record a partial-rejection retry round.
pub fn record_partial_retry(shard_id: &str, entries: usize) {
    let shard = shard_id.to_string();
    counter!("replicator_partial_retries_total", "shard_id" => shard.clone()).increment(1);
    counter!("replicator_entries_retried_total", "shard_id" => shard).increment(entries as u64);
}

/// Record rejected entries by downstream error code.
pub fn record_rejected_entries(shard_id: &str, code: &str, count: usize) {
    counter!(
        "replicator_entries_rejected_total",
        "shard_id" => shard_id.to_string(),
        "code" => code.to_string()
    )
    .increment(count as u64);
}

/// Record a transport failure that will be retried.
pub fn record_transport_retry(shard_id: &str, reason: &str) {
    counter!(
        "replicator_transport_retries_total",
        "shard_id" => shard_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a sink that answered with the wrong number of outcomes.
pub fn record_protocol_violation(shard_id: &str) {
    counter!("replicator_protocol_violations_total", "shard_id" => shard_id.to_string()).increment(1);
}

/// Record a checkpoint attempt.
pub fn record_checkpoint(shard_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicator_checkpoints_total", "shard_id" => shard_id.to_string(), "status" => status)
        .increment(1);
}

/// Record the latest checkpointed position.
pub fn set_checkpoint_position(shard_id: &str, position: u64) {
    gauge!("replicator_checkpoint_position", "shard_id" => shard_id.to_string()).set(position as f64);
}

/// Record buffered records dropped by a shutdown or fatal error.
pub fn record_records_discarded(shard_id: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!("replicator_records_discarded_total", "shard_id" => shard_id.to_string())
        .increment(count as u64);
}

/// Gauge for worker state.
pub fn set_worker_state(shard_id: &str, state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Idle" => 1.0,
        "Accumulating" => 2.0,
        "Flushing" => 3.0,
        "Shutdown" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replicator_worker_state", "shard_id" => shard_id.to_string()).set(value);
}

/// Record an error by type.
pub fn record_error(shard_id: &str, error_type: &str) {
    counter!(
        "replicator_errors_total",
        "shard_id" => shard_id.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// =============================================================================
// Source Metrics
// =============================================================================

/// Record a fetch from the input stream.
pub fn record_fetch(shard_id: &str, records: usize, duration: Duration) {
    let shard = shard_id.to_string();
    counter!("replicator_fetches_total", "shard_id" => shard.clone()).increment(1);
    if records == 0 {
        counter!("replicator_empty_fetches_total", "shard_id" => shard.clone()).increment(1);
    }
    histogram!("replicator_fetch_size", "shard_id" => shard.clone()).record(records as f64);
    histogram!("replicator_fetch_duration_seconds", "shard_id" => shard).record(duration.as_secs_f64());
}

/// Record a failed fetch.
pub fn record_fetch_error(shard_id: &str) {
    counter!("replicator_fetch_errors_total", "shard_id" => shard_id.to_string()).increment(1);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replicator_engine_state").set(value);
}

/// Number of shards this engine currently holds a lease for.
pub fn set_owned_shards(count: usize) {
    gauge!("replicator_owned_shards").set(count as f64);
}

/// Record a lease lost to another worker.
pub fn record_lease_lost(shard_id: &str) {
    counter!("replicator_leases_lost_total", "shard_id" => shard_id.to_string()).increment(1);
}

/// Record a SQLITE_BUSY/LOCKED retry in the checkpoint store.
pub fn record_store_busy_retry(operation: &str) {
    counter!("replicator_store_busy_retries_total", "operation" => operation.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; the tests make sure
    // every label combination is accepted.

    #[test]
    fn test_record_worker_metrics() {
        record_records_received("shard-1", 10);
        record_flush("shard-1", 3, 1024, 1, Duration::from_millis(5));
        record_flush("shard-1", 0, 0, 0, Duration::ZERO);
        record_checkpoint("shard-1", true);
        record_checkpoint("shard-1", false);
        set_checkpoint_position("shard-1", 42);
    }

    #[test]
    fn test_record_retry_metrics() {
        record_partial_retry("shard-1", 2);
        record_rejected_entries("shard-1", "ProvisionedThroughputExceededException", 2);
        record_transport_retry("shard-1", "error");
        record_transport_retry("shard-1", "timeout");
        record_protocol_violation("shard-1");
    }

    #[test]
    fn test_record_records_discarded_zero_is_noop() {
        record_records_discarded("shard-1", 0);
        record_records_discarded("shard-1", 5);
    }

    #[test]
    fn test_set_worker_state_all_states() {
        for state in ["Created", "Idle", "Accumulating", "Flushing", "Shutdown", "Failed", "unknown"] {
            set_worker_state("shard-1", state);
        }
    }

    #[test]
    fn test_set_engine_state_all_states() {
        for state in ["Created", "Starting", "Running", "ShuttingDown", "Stopped", "Failed", "unknown"] {
            set_engine_state(state);
        }
    }

    #[test]
    fn test_source_and_engine_metrics() {
        record_fetch("shard-1", 100, Duration::from_millis(20));
        record_fetch("shard-1", 0, Duration::from_millis(1));
        record_fetch_error("shard-1");
        set_owned_shards(4);
        record_lease_lost("shard-1");
        record_store_busy_retry("put");
        record_error("shard-1", "protocol_violation");
    }
}
