// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Output stream integration.
//!
//! [`RecordSink`] is the narrow interface to the downstream stream: one call
//! writes a slice of records and answers with one [`EntryOutcome`] per entry,
//! in submission order. [`RetryingSink`] wraps it with the delivery protocol:
//!
//! - A transport failure (error or timeout) retries the whole request.
//! - A partial rejection retries only the rejected entries, in order.
//! - Both back off exponentially and never give up; only a shutdown signal
//!   ends the loop early.
//! - An answer with the wrong number of outcomes is a protocol violation and
//!   aborts the batch.
//!
//! # Example
//!
//! ```rust,no_run
//! use stream_replicator::record::Record;
//! use stream_replicator::sink::{BoxFuture, EntryOutcome, RecordSink};
//!
//! struct StdoutSink;
//!
//! impl RecordSink for StdoutSink {
//!     fn write_batch<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, Vec<EntryOutcome>> {
//!         Box::pin(async move {
//!             for record in records {
//!                 println!("{} {}", record.partition_key, record.position);
//!             }
//!             Ok(vec![EntryOutcome::Accepted; records.len()])
//!         })
//!     }
//! }
//! ```

use crate::batch::Batch;
use crate::error::{ReplicatorError, Result};
use crate::metrics;
use crate::record::Record;
use crate::resilience::{is_signalled, shutdown_signalled, sleep_or_shutdown, RetryConfig, Sleeper};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Type alias for boxed async sink futures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = std::result::Result<T, TransportError>> + Send + 'a>>;

/// The write call itself failed; no per-entry outcome is known.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Per-entry result of a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Accepted,
    Rejected { code: String, message: String },
}

impl EntryOutcome {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// What we need from the output stream.
///
/// Implementations must return exactly one outcome per submitted record, in
/// the order submitted.
pub trait RecordSink: Send + Sync + 'static {
    /// Write records as one request.
    fn write_batch<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, Vec<EntryOutcome>>;
}

// =============================================================================
// Retry State
// =============================================================================

/// Result of applying one answered write to a [`RetryState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub accepted: usize,
    pub rejected: usize,
    /// Rejected entry count per error code.
    pub codes: BTreeMap<String, usize>,
}

/// Partial-rejection retry state for one batch.
///
/// Holds the entries still awaiting acceptance and the number of rejecting
/// rounds so far. The counter is per batch: it only grows until the batch is
/// fully delivered.
#[derive(Debug)]
pub struct RetryState {
    attempt: u32,
    pending: Vec<Record>,
}

impl RetryState {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            attempt: 0,
            pending: records,
        }
    }

    /// Entries to submit in the next request.
    pub fn pending(&self) -> &[Record] {
        &self.pending
    }

    /// Number of rounds that ended with rejections.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once every entry has been accepted.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply the outcomes of a write of [`Self::pending`].
    ///
    /// Keeps only rejected entries, preserving their relative order. A length
    /// mismatch leaves the state untouched and returns
    /// [`ReplicatorError::ProtocolViolation`].
    pub fn apply(&mut self, shard_id: &str, outcomes: Vec<EntryOutcome>) -> Result<RoundSummary> {
        if outcomes.len() != self.pending.len() {
            return Err(ReplicatorError::ProtocolViolation {
                shard_id: shard_id.to_string(),
                submitted: self.pending.len(),
                returned: outcomes.len(),
            });
        }

        let mut summary = RoundSummary::default();
        let submitted = std::mem::take(&mut self.pending);
        for (record, outcome) in submitted.into_iter().zip(outcomes) {
            match outcome {
                EntryOutcome::Accepted => summary.accepted += 1,
                EntryOutcome::Rejected { code, .. } => {
                    summary.rejected += 1;
                    *summary.codes.entry(code).or_insert(0) += 1;
                    self.pending.push(record);
                }
            }
        }

        if summary.rejected > 0 {
            self.attempt += 1;
        }
        Ok(summary)
    }

    /// Backoff before resubmitting the pending entries.
    pub fn next_delay(&self, retry: &RetryConfig) -> Duration {
        retry.delay_for_attempt(self.attempt)
    }
}

// =============================================================================
// Retrying Sink
// =============================================================================

/// Counters for a delivered batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Records in the batch.
    pub records: usize,
    /// Payload bytes in the batch.
    pub bytes: usize,
    /// Total `write_batch` calls, including failed ones.
    pub write_calls: u32,
    /// Write calls that failed or timed out.
    pub transport_failures: u32,
    /// Rounds that ended with at least one rejection.
    pub partial_rounds: u32,
    /// Rejected entries summed over all rounds.
    pub rejected_entries: usize,
    pub duration: Duration,
}

/// Result of [`RetryingSink::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every record was accepted downstream.
    Delivered(DeliveryReport),
    /// Shutdown interrupted delivery; `undelivered` entries were never accepted.
    Cancelled { undelivered: usize },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}

/// Delivers batches with partial-failure retry.
pub struct RetryingSink<S: RecordSink> {
    sink: Arc<S>,
    shard_id: String,
    retry: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl<S: RecordSink> RetryingSink<S> {
    pub fn new(sink: Arc<S>, shard_id: impl Into<String>, retry: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            sink,
            shard_id: shard_id.into(),
            retry,
            sleeper,
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Deliver every record of `batch`, retrying until accepted.
    ///
    /// Returns `Cancelled` if `shutdown` is signalled before the batch is fully
    /// accepted, interrupting an in-flight write or backoff.
    pub async fn send(&self, batch: Batch, shutdown: &mut watch::Receiver<bool>) -> Result<SendOutcome> {
        let start = Instant::now();
        let mut report = DeliveryReport {
            records: batch.len(),
            bytes: batch.bytes(),
            ..Default::default()
        };
        let mut state = RetryState::new(batch.into_records());

        while !state.is_complete() {
            let outcomes = match self.write_until_answered(state.pending(), &mut report, shutdown).await {
                Some(outcomes) => outcomes,
                None => {
                    return Ok(SendOutcome::Cancelled {
                        undelivered: state.pending().len(),
                    })
                }
            };

            let round = match state.apply(&self.shard_id, outcomes) {
                Ok(round) => round,
                Err(e) => {
                    error!(shard_id = %self.shard_id, error = %e, "Sink broke the outcome contract, aborting batch");
                    metrics::record_protocol_violation(&self.shard_id);
                    return Err(e);
                }
            };

            if round.rejected == 0 {
                break;
            }

            report.partial_rounds += 1;
            report.rejected_entries += round.rejected;
            for (code, count) in &round.codes {
                metrics::record_rejected_entries(&self.shard_id, code, *count);
            }
            metrics::record_partial_retry(&self.shard_id, round.rejected);

            let delay = state.next_delay(&self.retry);
            warn!(
                shard_id = %self.shard_id,
                accepted = round.accepted,
                retrying = round.rejected,
                attempt = state.attempt(),
                delay_ms = delay.as_millis() as u64,
                codes = ?round.codes,
                "Partial batch rejection, resubmitting failed entries"
            );

            if !sleep_or_shutdown(self.sleeper.as_ref(), delay, shutdown).await {
                return Ok(SendOutcome::Cancelled {
                    undelivered: state.pending().len(),
                });
            }
        }

        report.duration = start.elapsed();
        debug!(
            shard_id = %self.shard_id,
            records = report.records,
            write_calls = report.write_calls,
            "Batch delivered"
        );
        Ok(SendOutcome::Delivered(report))
    }

    /// Issue one request, retrying transport failures until the sink answers.
    ///
    /// The transport attempt counter starts fresh for every request. Returns
    /// `None` on shutdown.
    async fn write_until_answered(
        &self,
        entries: &[Record],
        report: &mut DeliveryReport,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Vec<EntryOutcome>> {
        let mut failures: u32 = 0;

        loop {
            if is_signalled(shutdown) {
                return None;
            }

            report.write_calls += 1;
            let write = tokio::time::timeout(self.retry.request_timeout, self.sink.write_batch(entries));
            let result = tokio::select! {
                biased;
                _ = shutdown_signalled(shutdown) => return None,
                result = write => result,
            };

            let reason = match result {
                Ok(Ok(outcomes)) => return Some(outcomes),
                Ok(Err(e)) => {
                    warn!(shard_id = %self.shard_id, entries = entries.len(), error = %e, "Sink write failed");
                    "error"
                }
                Err(_) => {
                    warn!(
                        shard_id = %self.shard_id,
                        entries = entries.len(),
                        timeout_ms = self.retry.request_timeout.as_millis() as u64,
                        "Sink write timed out"
                    );
                    "timeout"
                }
            };

            failures += 1;
            report.transport_failures += 1;
            metrics::record_transport_retry(&self.shard_id, reason);

            let delay = self.retry.delay_for_attempt(failures);
            warn!(
                shard_id = %self.shard_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Retrying whole request after transport failure"
            );

            if !sleep_or_shutdown(self.sleeper.as_ref(), delay, shutdown).await {
                return None;
            }
        }
    }
}
