// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the stream replicator.
//!
//! Errors are categorized by whether the shard can keep going. Transport
//! failures and partial rejections on the write path are absorbed by the
//! retry loop in [`crate::sink::RetryingSink`] and never show up here; what
//! does show up is either a transient read failure or something that must
//! stop the worker.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Source` | Yes | Fetch from the input shard failed |
//! | `ProtocolViolation` | No | Sink answered with the wrong number of outcomes |
//! | `Checkpoint` | No | Checkpoint rejected (lease lost, shutting down, store failure) |
//! | `CheckpointStore` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Worker or engine lifecycle violation |
//! | `Shutdown` | No | Worker has shut down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Fatal Errors
//!
//! A non-retryable error from [`crate::worker::ShardWorker::on_records`]
//! terminates the worker. The lease manager is expected to reassign the
//! shard; the next worker resumes from the last advanced checkpoint and
//! re-delivers whatever was in flight.

use crate::checkpoint::CheckpointError;
use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

/// Errors that can occur while replicating a shard.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// Reading from the input shard failed.
    ///
    /// Retryable with backoff; the read position has not moved.
    #[error("Source error ({shard_id}): {message}")]
    Source { shard_id: String, message: String },

    /// The sink returned a different number of outcomes than entries submitted.
    ///
    /// The sink contract is broken, so there is no way to tell which entries
    /// landed. Not retryable.
    #[error("Sink protocol violation ({shard_id}): submitted {submitted} entries, got {returned} outcomes")]
    ProtocolViolation {
        shard_id: String,
        submitted: usize,
        returned: usize,
    },

    /// The checkpoint handle rejected the write.
    ///
    /// Not retryable: another worker may already own the shard.
    #[error("Checkpoint failed ({shard_id}): {source}")]
    Checkpoint {
        shard_id: String,
        #[source]
        source: CheckpointError,
    },

    /// SQLite error in the local checkpoint store.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation (e.g. records delivered before `initialize`).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The worker has shut down and accepts no further records.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicatorError {
    /// Wrap a checkpoint rejection for a shard.
    pub fn checkpoint(shard_id: impl Into<String>, source: CheckpointError) -> Self {
        Self::Checkpoint {
            shard_id: shard_id.into(),
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source { .. } => true,
            Self::ProtocolViolation { .. } => false,
            Self::Checkpoint { .. } => false,
            Self::CheckpointStore(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// True when the error means this process no longer owns the shard.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Self::Checkpoint {
                source: CheckpointError::InvalidState(_),
                ..
            }
        )
    }

    /// Short label used for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Source { .. } => "source",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::Checkpoint { .. } => "checkpoint",
            Self::CheckpointStore(_) => "checkpoint_store",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
