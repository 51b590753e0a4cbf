// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Worker state types.
//!
//! # State Transitions
//!
//! ```text
//!            initialize()
//! Created ─────────────────→ Idle ←──────────────────────┐
//!                             │                          │
//!                             │ append                   │ delivered +
//!                             ↓                          │ checkpointed
//!                        Accumulating ──threshold──→ Flushing
//!                             │                          │
//!            on_shutdown() /  │                          │ cancelled, or
//!            signal           ↓                          │ signalled before checkpoint
//!                          Shutdown ←────────────────────┘
//!
//! any fatal error (protocol violation, checkpoint rejected) ──→ Failed
//! ```
//!
//! - **Created**: built by the factory, `initialize()` not yet called.
//! - **Idle**: nothing buffered.
//! - **Accumulating**: records buffered, no threshold reached.
//! - **Flushing**: a batch is being delivered and checkpointed.
//! - **Shutdown**: terminal. Buffer discarded, no further checkpoints.
//! - **Failed**: terminal. A fatal error was returned to the caller.

use crate::record::Position;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// State of a shard worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Idle,
    Accumulating,
    Flushing,
    Shutdown,
    Failed,
}

impl WorkerState {
    /// True for `Shutdown` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Shutdown | WorkerState::Failed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Created => write!(f, "Created"),
            WorkerState::Idle => write!(f, "Idle"),
            WorkerState::Accumulating => write!(f, "Accumulating"),
            WorkerState::Flushing => write!(f, "Flushing"),
            WorkerState::Shutdown => write!(f, "Shutdown"),
            WorkerState::Failed => write!(f, "Failed"),
        }
    }
}

/// Why a worker is being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The process is stopping.
    Requested,
    /// The lease manager reassigned the shard.
    Revoked,
    /// A checkpoint found the lease held by someone else.
    LeaseLost,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Requested => write!(f, "requested"),
            ShutdownReason::Revoked => write!(f, "revoked"),
            ShutdownReason::LeaseLost => write!(f, "lease_lost"),
        }
    }
}

/// Summary of one `on_records` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Records handed in.
    pub received: usize,
    /// Batches delivered.
    pub flushes: usize,
    /// Records accepted downstream.
    pub records_delivered: usize,
    /// Last position written during this call.
    pub last_checkpoint: Option<Position>,
    /// Shutdown interrupted processing.
    pub interrupted: bool,
    /// Records dropped without delivery because of the interruption.
    pub discarded: usize,
}

/// Cloneable handle that interrupts a worker from another task.
///
/// Signalling is sticky: once set it stays set.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. In-flight writes and backoff sleeps end promptly.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    /// New receiver observing this handle.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
