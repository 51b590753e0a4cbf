// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpointing of the shard read position.
//!
//! The checkpoint is the position of the last record of the last fully
//! delivered batch. On restart (or when another worker takes over the shard)
//! reading resumes right after it.
//!
//! ```text
//! drain batch ──▶ send (retry until accepted) ──▶ advance(last_position)
//!                   (shutdown here = no advance, batch is re-read later)
//! ```
//!
//! [`CheckpointCoordinator`] keeps the per-worker monotonic view and calls a
//! [`Checkpointer`], the per-delivery handle supplied by whoever owns the
//! lease. [`store::StoreCheckpointer`] is the SQLite-backed handle.

pub mod store;

use crate::error::{ReplicatorError, Result};
use crate::metrics;
use crate::record::Position;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tracing::{debug, error, warn};

pub use store::{CheckpointEntry, CheckpointStore, StoreCheckpointer};

/// Reasons a checkpoint write is refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    /// The caller no longer holds the lease for the shard.
    #[error("lease no longer held: {0}")]
    InvalidState(String),

    /// The process is shutting down and accepts no further checkpoints.
    #[error("checkpointer is shutting down")]
    ShuttingDown,

    /// The durable store failed.
    #[error("checkpoint store failure: {0}")]
    Store(String),
}

/// Boxed future returned by [`Checkpointer::checkpoint`].
pub type CheckpointFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<(), CheckpointError>> + Send + 'a>>;

/// Durable write of a shard's read position.
pub trait Checkpointer: Send + Sync {
    /// Persist `position` as the last processed record.
    fn checkpoint(&self, position: Position) -> CheckpointFuture<'_>;
}

/// Tracks the last checkpointed position of one shard.
#[derive(Debug, Clone)]
pub struct CheckpointCoordinator {
    shard_id: String,
    last: Option<Position>,
}

impl CheckpointCoordinator {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            last: None,
        }
    }

    /// Start from a position already persisted by an earlier owner.
    pub fn resume_from(shard_id: impl Into<String>, last: Option<Position>) -> Self {
        Self {
            shard_id: shard_id.into(),
            last,
        }
    }

    /// Last position this coordinator wrote (or resumed from).
    pub fn last_checkpointed(&self) -> Option<Position> {
        self.last
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Persist `position` through `checkpointer`.
    ///
    /// Returns `Ok(false)` without writing when `position` does not move past
    /// the last checkpoint. Any refusal from the checkpointer is fatal for the
    /// worker and comes back as [`ReplicatorError::Checkpoint`].
    pub async fn advance(&mut self, checkpointer: &dyn Checkpointer, position: Position) -> Result<bool> {
        if let Some(last) = self.last {
            if position <= last {
                warn!(
                    shard_id = %self.shard_id,
                    position = %position,
                    last = %last,
                    "Checkpoint would not advance, skipping"
                );
                return Ok(false);
            }
        }

        match checkpointer.checkpoint(position).await {
            Ok(()) => {
                self.last = Some(position);
                metrics::record_checkpoint(&self.shard_id, true);
                metrics::set_checkpoint_position(&self.shard_id, position.value());
                debug!(shard_id = %self.shard_id, position = %position, "Checkpoint advanced");
                Ok(true)
            }
            Err(e) => {
                metrics::record_checkpoint(&self.shard_id, false);
                error!(shard_id = %self.shard_id, position = %position, error = %e, "Checkpoint rejected");
                Err(ReplicatorError::checkpoint(&self.shard_id, e))
            }
        }
    }
}
