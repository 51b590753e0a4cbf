// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state types.
//!
//! Defines the state machine for the replication engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (leases taken, shard loops spawned)
//!    │                              ↓
//!    │                          Running
//!    │                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    │                        ShuttingDown
//!    │                              │
//!    ↓                              ↓
//! Stopped ←─────────────────────────┘
//!
//! Starting ──(invalid config, shard listing failed)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplicationEngine::new()`. Nothing running.
//! - **Starting**: `start()` called, listing shards and taking leases.
//! - **Running**: One shard loop per owned shard is fetching and delivering.
//! - **ShuttingDown**: `shutdown()` called. Shard loops are draining.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//! - **Failed**: Start failed. Engine cannot continue.

use crate::record::Position;
use crate::worker::WorkerState;

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,

    /// Listing shards and acquiring leases.
    Starting,

    /// Running and replicating.
    Running,

    /// Shutting down gracefully.
    ///
    /// Workers are interrupted; nothing undelivered is checkpointed.
    ShuttingDown,

    /// Stopped.
    ///
    /// Engine has shut down cleanly and the checkpoint store is closed.
    Stopped,

    /// Failed to start.
    ///
    /// Check logs for error details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health of one shard owned by this engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHealth {
    pub shard_id: String,
    /// Worker state as last reported by the shard loop.
    pub worker_state: WorkerState,
    /// Last checkpointed position (resumed or written).
    pub last_checkpoint: Option<Position>,
    /// Records delivered since the shard loop started.
    pub records_delivered: u64,
    /// The shard loop is still running.
    pub active: bool,
    /// The lease moved to another worker.
    pub lease_lost: bool,
    /// Fatal error that stopped the shard, if any.
    pub last_error: Option<String>,
}

impl ShardHealth {
    pub(crate) fn new(shard_id: &str) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            worker_state: WorkerState::Created,
            last_checkpoint: None,
            records_delivered: 0,
            active: true,
            lease_lost: false,
            last_error: None,
        }
    }
}

/// Health snapshot for monitoring endpoints.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Engine is running and accepting work.
    pub ready: bool,
    /// Ready, and no shard stopped on a fatal error.
    pub healthy: bool,
    pub shards_total: usize,
    pub shards_active: usize,
    pub shards_failed: usize,
    /// Per-shard details, sorted by shard id.
    pub shards: Vec<ShardHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Starting.to_string(), "Starting");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_engine_state_equality() {
        assert_eq!(EngineState::Created, EngineState::Created);
        assert_ne!(EngineState::Created, EngineState::Running);
    }

    #[test]
    fn test_shard_health_new() {
        let health = ShardHealth::new("shard-1");
        assert_eq!(health.shard_id, "shard-1");
        assert_eq!(health.worker_state, WorkerState::Created);
        assert!(health.active);
        assert!(!health.lease_lost);
        assert!(health.last_error.is_none());
    }
}
