// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-shard replication worker.
//!
//! A [`ShardWorker`] owns the buffer, the retrying sink and the checkpoint
//! view of exactly one shard. It is driven by a single task: every call takes
//! `&mut self`, so there is no locking inside. The only cross-task input is
//! its [`ShutdownHandle`].
//!
//! # Delivery Guarantee
//!
//! A checkpoint is only ever written for the last record of a batch that was
//! accepted in full downstream. Anything buffered or in flight when shutdown
//! arrives is dropped without a checkpoint, so the next owner of the shard
//! reads it again (at-least-once). A checkpoint call still pending when
//! shutdown arrives is abandoned.

mod types;

pub use types::{ProcessReport, ShutdownHandle, ShutdownReason, WorkerState};

use crate::batch::{BatchBuffer, FlushThresholds};
use crate::checkpoint::{CheckpointCoordinator, Checkpointer};
use crate::error::{ReplicatorError, Result};
use crate::metrics;
use crate::record::{Position, Record};
use crate::resilience::{is_signalled, shutdown_signalled, RetryConfig, Sleeper};
use crate::sink::{RecordSink, RetryingSink, SendOutcome};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Replicates one shard.
pub struct ShardWorker<S: RecordSink> {
    shard_id: String,
    state: WorkerState,
    buffer: BatchBuffer,
    sink: RetryingSink<S>,
    checkpoints: CheckpointCoordinator,
    shutdown: ShutdownHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: RecordSink> ShardWorker<S> {
    /// Create a worker in `Created` state.
    pub fn new(
        shard_id: impl Into<String>,
        sink: Arc<S>,
        thresholds: FlushThresholds,
        retry: RetryConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let shard_id = shard_id.into();
        let shutdown = ShutdownHandle::new();
        let shutdown_rx = shutdown.subscribe();
        metrics::set_worker_state(&shard_id, "Created");

        Self {
            buffer: BatchBuffer::new(shard_id.clone(), thresholds),
            sink: RetryingSink::new(sink, shard_id.clone(), retry, sleeper),
            checkpoints: CheckpointCoordinator::new(shard_id.clone()),
            shard_id,
            state: WorkerState::Created,
            shutdown,
            shutdown_rx,
        }
    }

    /// Seed the checkpoint view with a position persisted by an earlier owner.
    pub fn resume_from(mut self, last: Option<Position>) -> Self {
        self.checkpoints = CheckpointCoordinator::resume_from(self.shard_id.clone(), last);
        self
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Records currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_checkpoint(&self) -> Option<Position> {
        self.checkpoints.last_checkpointed()
    }

    pub fn thresholds(&self) -> FlushThresholds {
        self.buffer.thresholds()
    }

    /// Handle for interrupting this worker from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Bind the worker to its shard.
    pub fn initialize(&mut self, shard_id: &str) -> Result<()> {
        if self.state != WorkerState::Created {
            return Err(ReplicatorError::InvalidState {
                expected: WorkerState::Created.to_string(),
                actual: self.state.to_string(),
            });
        }
        if shard_id != self.shard_id {
            return Err(ReplicatorError::InvalidState {
                expected: format!("shard {}", self.shard_id),
                actual: format!("shard {}", shard_id),
            });
        }

        self.set_state(WorkerState::Idle);
        info!(
            shard_id = %self.shard_id,
            max_records = self.buffer.thresholds().max_records,
            max_bytes = self.buffer.thresholds().max_bytes,
            resume_after = ?self.checkpoints.last_checkpointed(),
            "Shard worker initialized"
        );
        Ok(())
    }

    /// Buffer `records`, flushing at every threshold and once more at the end.
    ///
    /// Returns once everything handed in has been delivered and
    /// checkpointed, or early with `interrupted` set when shutdown arrives.
    pub async fn on_records(&mut self, records: Vec<Record>, checkpointer: &dyn Checkpointer) -> Result<ProcessReport> {
        match self.state {
            WorkerState::Shutdown => return Err(ReplicatorError::Shutdown),
            WorkerState::Created | WorkerState::Failed => {
                return Err(ReplicatorError::InvalidState {
                    expected: WorkerState::Idle.to_string(),
                    actual: self.state.to_string(),
                })
            }
            _ => {}
        }

        let received = records.len();
        let mut report = ProcessReport {
            received,
            ..Default::default()
        };
        metrics::record_records_received(&self.shard_id, received);

        if is_signalled(&self.shutdown_rx) {
            report.discarded = received + self.enter_shutdown(ShutdownReason::Requested);
            report.interrupted = true;
            return Ok(report);
        }

        for (index, record) in records.into_iter().enumerate() {
            self.buffer.append(record);
            if self.state == WorkerState::Idle {
                self.set_state(WorkerState::Accumulating);
            }

            if self.buffer.should_flush() && !self.flush(checkpointer, &mut report).await? {
                report.discarded += received - index - 1;
                return Ok(report);
            }
        }

        if !self.buffer.is_empty() {
            self.flush(checkpointer, &mut report).await?;
        }

        Ok(report)
    }

    /// Stop the worker, discarding anything buffered.
    ///
    /// Returns the number of discarded records. Calling it again is a no-op.
    pub fn on_shutdown(&mut self, reason: ShutdownReason) -> usize {
        self.shutdown.signal();
        if self.state.is_terminal() {
            return 0;
        }
        self.enter_shutdown(reason)
    }

    /// Drain, deliver and checkpoint the buffer.
    ///
    /// Returns `Ok(false)` if shutdown interrupted the flush.
    async fn flush(&mut self, checkpointer: &dyn Checkpointer, report: &mut ProcessReport) -> Result<bool> {
        let batch = self.buffer.drain();
        let last = batch.last_position();
        self.set_state(WorkerState::Flushing);
        debug!(shard_id = %self.shard_id, records = batch.len(), bytes = batch.bytes(), "Flushing batch");

        let delivered = match self.sink.send(batch, &mut self.shutdown_rx).await {
            Ok(SendOutcome::Delivered(delivered)) => delivered,
            Ok(SendOutcome::Cancelled { undelivered }) => {
                info!(shard_id = %self.shard_id, undelivered, "Flush interrupted by shutdown");
                report.discarded += undelivered + self.enter_shutdown(ShutdownReason::Requested);
                report.interrupted = true;
                return Ok(false);
            }
            Err(e) => return Err(self.fail(e)),
        };

        metrics::record_flush(
            &self.shard_id,
            delivered.records,
            delivered.bytes,
            delivered.write_calls,
            delivered.duration,
        );
        report.flushes += 1;
        report.records_delivered += delivered.records;

        if is_signalled(&self.shutdown_rx) {
            info!(
                shard_id = %self.shard_id,
                position = ?last,
                "Shutdown after delivery, skipping checkpoint"
            );
            self.enter_shutdown(ShutdownReason::Requested);
            report.interrupted = true;
            return Ok(false);
        }

        if let Some(position) = last {
            let advanced = tokio::select! {
                biased;
                result = self.checkpoints.advance(checkpointer, position) => Some(result),
                _ = shutdown_signalled(&mut self.shutdown_rx) => None,
            };
            match advanced {
                Some(Ok(true)) => report.last_checkpoint = Some(position),
                Some(Ok(false)) => {}
                Some(Err(e)) => return Err(self.fail(e)),
                None => {
                    info!(
                        shard_id = %self.shard_id,
                        position = %position,
                        "Shutdown during checkpoint, abandoning it"
                    );
                    self.enter_shutdown(ShutdownReason::Requested);
                    report.interrupted = true;
                    return Ok(false);
                }
            }
        }

        self.set_state(WorkerState::Idle);
        Ok(true)
    }

    fn enter_shutdown(&mut self, reason: ShutdownReason) -> usize {
        let discarded = self.buffer.drain().len();
        metrics::record_records_discarded(&self.shard_id, discarded);
        self.set_state(WorkerState::Shutdown);
        info!(
            shard_id = %self.shard_id,
            reason = %reason,
            discarded,
            last_checkpoint = ?self.checkpoints.last_checkpointed(),
            "Shard worker shut down"
        );
        discarded
    }

    fn fail(&mut self, e: ReplicatorError) -> ReplicatorError {
        let discarded = self.buffer.drain().len();
        metrics::record_records_discarded(&self.shard_id, discarded);
        metrics::record_error(&self.shard_id, e.kind());
        self.set_state(WorkerState::Failed);
        if e.is_lease_lost() {
            warn!(shard_id = %self.shard_id, error = %e, "Lease lost, worker stopping");
        } else {
            error!(shard_id = %self.shard_id, error = %e, discarded, "Shard worker failed");
        }
        e
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            self.state = state;
            metrics::set_worker_state(&self.shard_id, &state.to_string());
        }
    }
}
