// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Builds one [`ShardWorker`] per shard assignment.

use crate::batch::FlushThresholds;
use crate::resilience::{RetryConfig, Sleeper, TokioSleeper};
use crate::sink::RecordSink;
use crate::worker::ShardWorker;
use std::sync::Arc;
use tracing::debug;

/// Shared configuration for the workers of one replicator.
///
/// All workers write through the same sink handle; everything else a worker
/// owns is created fresh per shard.
pub struct WorkerFactory<S: RecordSink> {
    sink: Arc<S>,
    thresholds: FlushThresholds,
    retry: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl<S: RecordSink> Clone for WorkerFactory<S> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            thresholds: self.thresholds,
            retry: self.retry.clone(),
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<S: RecordSink> WorkerFactory<S> {
    /// Create a factory that sleeps on the tokio timer between retries.
    pub fn new(sink: Arc<S>, thresholds: FlushThresholds, retry: RetryConfig) -> Self {
        Self {
            sink,
            thresholds,
            retry,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper used by every worker created afterwards.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Create an uninitialized worker for `shard_id`.
    pub fn create_worker(&self, shard_id: &str) -> ShardWorker<S> {
        debug!(shard_id, "Creating shard worker");
        ShardWorker::new(
            shard_id,
            Arc::clone(&self.sink),
            self.thresholds,
            self.retry.clone(),
            Arc::clone(&self.sleeper),
        )
    }

    pub fn thresholds(&self) -> FlushThresholds {
        self.thresholds
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }
}
