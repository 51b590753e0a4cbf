// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The orchestrator that ties together:
//! - Shard discovery via [`crate::source::RecordSource`]
//! - Shard ownership via [`crate::lease::LeaseManager`]
//! - Per-shard workers from [`crate::factory::WorkerFactory`]
//! - Checkpoint persistence via [`crate::checkpoint::CheckpointStore`]
//!
//! # Architecture
//!
//! The coordinator manages the full replication lifecycle:
//! 1. Validates the configuration
//! 2. Lists the input shards and takes a lease on each free one
//! 3. Runs one shard loop per owned shard
//! 4. Handles graceful shutdown: workers are interrupted, nothing
//!    undelivered is checkpointed, leases are released

mod shard_loop;
mod types;

pub use types::{EngineState, HealthCheck, ShardHealth};

use crate::checkpoint::CheckpointStore;
use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::factory::WorkerFactory;
use crate::lease::LeaseManager;
use crate::metrics;
use crate::resilience::{RateLimiter, RetryConfig};
use crate::sink::RecordSink;
use crate::source::RecordSource;
use shard_loop::{run_shard, ShardLoopContext, ShardLoopSettings, ShardStatusMap};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The main replication engine.
///
/// Reads every shard of the input stream this process can lease and writes
/// the records to the output through the factory's sink. Delivery is
/// at-least-once: a position is checkpointed only after everything up to it
/// has been accepted downstream.
pub struct ReplicationEngine<S: RecordSink, R: RecordSource, L: LeaseManager> {
    config: ReplicatorConfig,

    factory: WorkerFactory<S>,

    source: Arc<R>,

    leases: Arc<L>,

    store: Arc<CheckpointStore>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,

    shutdown_rx: watch::Receiver<bool>,

    /// Per-shard status written by the shard loops
    shards: ShardStatusMap,

    /// Shard loop task handles
    handles: RwLock<Vec<(String, JoinHandle<()>)>>,
}

impl<S: RecordSink, R: RecordSource, L: LeaseManager> ReplicationEngine<S, R, L> {
    /// Create a new replication engine.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to take leases and begin replication.
    pub fn new(
        config: ReplicatorConfig,
        factory: WorkerFactory<S>,
        source: Arc<R>,
        leases: Arc<L>,
        store: Arc<CheckpointStore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            factory,
            source,
            leases,
            store,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            shards: Arc::new(RwLock::new(HashMap::new())),
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Shards this engine took a lease on, sorted.
    pub async fn owned_shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.shards.read().await.keys().cloned().collect();
        shards.sort();
        shards
    }

    /// Get health status for monitoring endpoints.
    ///
    /// Performs no I/O. Everything comes from state the shard loops publish.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let health = engine.health_check().await;
    ///
    /// // For /ready endpoint
    /// if health.ready {
    ///     HttpResponse::Ok()
    /// } else {
    ///     HttpResponse::ServiceUnavailable()
    /// }
    /// ```
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();

        let mut shards: Vec<ShardHealth> = self.shards.read().await.values().cloned().collect();
        shards.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));

        let shards_active = shards.iter().filter(|s| s.active).count();
        let shards_failed = shards.iter().filter(|s| s.last_error.is_some()).count();
        let ready = state == EngineState::Running;

        HealthCheck {
            state,
            ready,
            healthy: ready && shards_failed == 0,
            shards_total: shards.len(),
            shards_active,
            shards_failed,
            shards,
        }
    }

    /// Start the replication engine.
    ///
    /// 1. Validates the configuration
    /// 2. Lists input shards and takes a lease on each one that is free
    /// 3. Spawns one shard loop per owned shard
    ///
    /// Shards leased to another owner are skipped.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicatorError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            app_name = %self.config.app_name,
            worker_id = %self.config.worker_id,
            input = %self.config.input.stream_name,
            output = %self.config.output.stream_name,
            "Starting replication engine"
        );
        self.set_state(EngineState::Starting);

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid configuration");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        let shard_ids = match self.source.list_shards().await {
            Ok(shard_ids) => shard_ids,
            Err(e) => {
                error!(error = %e, "Failed to list input shards");
                self.set_state(EngineState::Failed);
                return Err(ReplicatorError::Source {
                    shard_id: self.config.input.stream_name.clone(),
                    message: e.to_string(),
                });
            }
        };

        let rate_limiter = self.config.rate_limit_config().map(|config| {
            info!(
                burst = config.burst_size,
                per_sec = config.refill_rate,
                "Fetch rate limiting enabled"
            );
            Arc::new(RateLimiter::new(config))
        });

        let ctx = ShardLoopContext {
            source: Arc::clone(&self.source),
            leases: Arc::clone(&self.leases),
            store: Arc::clone(&self.store),
            rate_limiter,
            status: Arc::clone(&self.shards),
        };
        let settings = ShardLoopSettings {
            owner: self.config.worker_id.clone(),
            initial_position: self.config.input.initial_position,
            max_records_per_fetch: self.config.input.max_records_per_fetch,
            idle_time: self.config.idle_time(),
            fetch_retry: RetryConfig::fetch(),
        };

        let mut handles = Vec::new();
        for shard_id in shard_ids {
            if !self.leases.assign(&shard_id, &self.config.worker_id).await {
                debug!(shard_id = %shard_id, "Shard leased elsewhere, skipping");
                continue;
            }

            self.shards
                .write()
                .await
                .insert(shard_id.clone(), ShardHealth::new(&shard_id));

            let worker = self.factory.create_worker(&shard_id);
            let handle = tokio::spawn(run_shard(
                worker,
                ctx.clone(),
                settings.clone(),
                self.shutdown_rx.clone(),
            ));
            handles.push((shard_id, handle));
        }

        metrics::set_owned_shards(handles.len());
        info!(shards = handles.len(), "Shard loops started");
        *self.handles.write().await = handles;

        self.set_state(EngineState::Running);
        info!("Replication engine running");
        Ok(())
    }

    /// Shutdown the replication engine gracefully.
    ///
    /// Interrupts every worker, waits up to `shutdown_timeout` for the shard
    /// loops to exit, then closes the checkpoint store.
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for shard loops to stop");
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        for (shard_id, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(shard_id = %shard_id, "Shard loop completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(shard_id = %shard_id, error = %e, "Shard loop panicked during shutdown");
                }
                Err(_) => {
                    warn!(shard_id = %shard_id, "Shard loop timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        metrics::set_owned_shards(0);
        self.store.close().await;

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }
}
