// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard loop: fetch from the input shard and feed the worker.
//!
//! Each owned shard has a dedicated task that:
//! 1. Resumes after the stored checkpoint (or at the configured initial position,
//!    with `LATEST` pinned to the shard tip on the first read)
//! 2. Fetches up to `max_records_per_fetch` records
//! 3. Hands them to the [`ShardWorker`], which batches, delivers and checkpoints
//! 4. Continues after the last fetched record
//!
//! # Graceful Shutdown
//!
//! Engine shutdown is forwarded to the worker's [`ShutdownHandle`], so an
//! in-flight write or backoff ends promptly. The worker drops what it has not
//! delivered and writes no further checkpoints. On exit the loop releases the
//! lease unless it was already lost.
//!
//! # Lease Loss
//!
//! Ownership is checked before every fetch and again by the checkpointer on
//! every checkpoint. Either way the worker is shut down with
//! [`ShutdownReason::LeaseLost`] and the loop exits without touching the lease.

use super::types::ShardHealth;
use crate::checkpoint::{CheckpointError, CheckpointStore, Checkpointer, StoreCheckpointer};
use crate::error::{ReplicatorError, Result};
use crate::lease::LeaseManager;
use crate::metrics;
use crate::record::Record;
use crate::resilience::{
    is_signalled, shutdown_signalled, sleep_or_shutdown, RateLimiter, RetryConfig, TokioSleeper,
};
use crate::sink::RecordSink;
use crate::source::{InitialPosition, RecordSource, SourceError, StartPosition};
use crate::worker::{ProcessReport, ShardWorker, ShutdownReason};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Per-shard loop settings derived from the engine config.
#[derive(Debug, Clone)]
pub(crate) struct ShardLoopSettings {
    pub owner: String,
    pub initial_position: InitialPosition,
    pub max_records_per_fetch: usize,
    pub idle_time: Duration,
    pub fetch_retry: RetryConfig,
}

pub(crate) type ShardStatusMap = Arc<RwLock<HashMap<String, ShardHealth>>>;

/// Collaborators shared by every shard loop of an engine.
pub(crate) struct ShardLoopContext<R: RecordSource, L: LeaseManager> {
    pub source: Arc<R>,
    pub leases: Arc<L>,
    pub store: Arc<CheckpointStore>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub status: ShardStatusMap,
}

impl<R: RecordSource, L: LeaseManager> Clone for ShardLoopContext<R, L> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            leases: Arc::clone(&self.leases),
            store: Arc::clone(&self.store),
            rate_limiter: self.rate_limiter.clone(),
            status: Arc::clone(&self.status),
        }
    }
}

/// Why a shard loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown,
    LeaseLost,
    Failed,
}

/// Run the shard loop until shutdown, lease loss or a fatal worker error.
pub(crate) async fn run_shard<S, R, L>(
    mut worker: ShardWorker<S>,
    ctx: ShardLoopContext<R, L>,
    settings: ShardLoopSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: RecordSink,
    R: RecordSource,
    L: LeaseManager,
{
    let shard_id = worker.shard_id().to_string();
    let span = info_span!("shard", shard_id = %shard_id);

    async move {
        let resume = ctx.store.get(&shard_id).await;
        worker = worker.resume_from(resume);
        if let Err(e) = worker.initialize(&shard_id) {
            error!(error = %e, "Failed to initialize shard worker");
            finish(&ctx, &worker, Exit::Failed, Some(e.to_string())).await;
            return;
        }

        let mut cursor = match resume {
            Some(position) => StartPosition::After(position),
            None => settings.initial_position.into(),
        };
        info!(cursor = %cursor, "Starting shard loop");

        let handle = worker.shutdown_handle();
        let checkpointer = StoreCheckpointer::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.leases),
            shard_id.clone(),
            settings.owner.clone(),
            handle.subscribe(),
        );

        let sleeper = TokioSleeper;
        let mut consecutive_errors: u32 = 0;
        let mut records_delivered: u64 = 0;
        let mut last_error: Option<String> = None;

        let exit = loop {
            if is_signalled(&shutdown_rx) {
                break Exit::Shutdown;
            }

            if !ctx.leases.is_owner(&shard_id, &settings.owner).await {
                warn!(owner = %settings.owner, "Lease no longer held, stopping shard");
                break Exit::LeaseLost;
            }

            let fetch_start = Instant::now();
            let fetched = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown_rx) => break Exit::Shutdown,
                result = next_records(ctx.source.as_ref(), &shard_id, &mut cursor, settings.max_records_per_fetch) => result,
            };

            let records = match fetched {
                Ok(records) => {
                    consecutive_errors = 0;
                    metrics::record_fetch(&shard_id, records.len(), fetch_start.elapsed());
                    records
                }
                Err(e) => {
                    consecutive_errors += 1;
                    metrics::record_fetch_error(&shard_id);
                    let delay = settings.fetch_retry.delay_for_attempt(consecutive_errors);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, backing off"
                    );
                    if !sleep_or_shutdown(&sleeper, delay, &mut shutdown_rx).await {
                        break Exit::Shutdown;
                    }
                    continue;
                }
            };

            if records.is_empty() {
                if !sleep_or_shutdown(&sleeper, settings.idle_time, &mut shutdown_rx).await {
                    break Exit::Shutdown;
                }
                continue;
            }

            if let Some(limiter) = &ctx.rate_limiter {
                tokio::select! {
                    biased;
                    _ = shutdown_signalled(&mut shutdown_rx) => break Exit::Shutdown,
                    _ = limiter.acquire_records(records.len()) => {}
                }
            }

            let next = records.last().map(|r| StartPosition::After(r.position));
            match deliver(&mut worker, records, &checkpointer, &mut shutdown_rx).await {
                Ok(report) => {
                    records_delivered += report.records_delivered as u64;
                    if report.interrupted {
                        break Exit::Shutdown;
                    }
                    if let Some(next) = next {
                        cursor = next;
                    }
                    debug!(
                        received = report.received,
                        flushes = report.flushes,
                        checkpoint = ?report.last_checkpoint,
                        "Delivery complete"
                    );
                    update_status(&ctx, &worker, records_delivered).await;
                }
                Err(ReplicatorError::Checkpoint {
                    source: CheckpointError::ShuttingDown,
                    ..
                }) => break Exit::Shutdown,
                Err(e) if e.is_lease_lost() => {
                    warn!(error = %e, "Checkpoint found the lease moved, stopping shard");
                    break Exit::LeaseLost;
                }
                Err(e) => {
                    error!(error = %e, "Shard worker failed, stopping shard");
                    last_error = Some(e.to_string());
                    break Exit::Failed;
                }
            }
        };

        let reason = match exit {
            Exit::LeaseLost => {
                metrics::record_lease_lost(&shard_id);
                ShutdownReason::LeaseLost
            }
            Exit::Shutdown | Exit::Failed => ShutdownReason::Requested,
        };
        worker.on_shutdown(reason);

        if exit != Exit::LeaseLost && !ctx.leases.revoke(&shard_id, &settings.owner).await {
            debug!("Lease was already released");
        }

        update_status(&ctx, &worker, records_delivered).await;
        finish(&ctx, &worker, exit, last_error).await;
        info!(exit = ?exit, records_delivered, "Shard loop stopped");
    }
    .instrument(span)
    .await
}

/// Fetch from `cursor`, pinning a `LATEST` cursor to the shard tip first.
async fn next_records<R: RecordSource>(
    source: &R,
    shard_id: &str,
    cursor: &mut StartPosition,
    limit: usize,
) -> std::result::Result<Vec<Record>, SourceError> {
    if *cursor == StartPosition::Latest {
        let tip = source.latest_position(shard_id).await?;
        *cursor = cursor.pin_latest(tip);
        info!(cursor = %cursor, "Pinned LATEST to the shard tip");
    }
    source.fetch(shard_id, *cursor, limit).await
}

/// Hand records to the worker, forwarding engine shutdown to it.
async fn deliver<S: RecordSink>(
    worker: &mut ShardWorker<S>,
    records: Vec<Record>,
    checkpointer: &dyn Checkpointer,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<ProcessReport> {
    let handle = worker.shutdown_handle();
    let delivery = worker.on_records(records, checkpointer);
    tokio::pin!(delivery);

    let mut forwarded = false;
    loop {
        tokio::select! {
            result = &mut delivery => return result,
            _ = shutdown_signalled(shutdown_rx), if !forwarded => {
                debug!("Forwarding engine shutdown to worker");
                handle.signal();
                forwarded = true;
            }
        }
    }
}

async fn update_status<R: RecordSource, L: LeaseManager, S: RecordSink>(
    ctx: &ShardLoopContext<R, L>,
    worker: &ShardWorker<S>,
    records_delivered: u64,
) {
    let mut status = ctx.status.write().await;
    let entry = status
        .entry(worker.shard_id().to_string())
        .or_insert_with(|| ShardHealth::new(worker.shard_id()));
    entry.worker_state = worker.state();
    entry.last_checkpoint = worker.last_checkpoint();
    entry.records_delivered = records_delivered;
}

async fn finish<R: RecordSource, L: LeaseManager, S: RecordSink>(
    ctx: &ShardLoopContext<R, L>,
    worker: &ShardWorker<S>,
    exit: Exit,
    last_error: Option<String>,
) {
    let mut status = ctx.status.write().await;
    let entry = status
        .entry(worker.shard_id().to_string())
        .or_insert_with(|| ShardHealth::new(worker.shard_id()));
    entry.worker_state = worker.state();
    entry.active = false;
    entry.lease_lost = exit == Exit::LeaseLost;
    if exit == Exit::Failed {
        entry.last_error = last_error;
    }
}
